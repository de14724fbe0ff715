// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ring bookkeeping for submission and completion queues.

use crate::spec;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

pub const SQ_ENTRY_BYTES: usize = size_of::<spec::Command>();
pub const CQ_ENTRY_BYTES: usize = size_of::<spec::Completion>();

/// A host-visible 16-bit doorbell register.
///
/// Doorbells are the only storage written by both the host and the
/// controller, so every access is atomic. The store the completion producer
/// issues after posting an entry must not be reordered before the entry
/// bytes; `SeqCst` covers that.
#[derive(Debug, Default)]
pub struct DoorbellRegister {
    value: AtomicU16,
}

impl DoorbellRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, value: u16) {
        self.value.store(value, Ordering::SeqCst);
    }

    pub fn read(&self) -> u16 {
        self.value.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid queue size {0}")]
    InvalidQueueSize(u16),
}

/// One ring in host memory, either side of a queue pair.
///
/// The pairing link carries the opposite side's queue id, resolved against
/// the engine-owned registries; queues never own each other.
pub struct Queue {
    queue_id: u16,
    slot_count: u16,
    entry_bytes: usize,
    memory_address: u64,
    doorbell: Arc<DoorbellRegister>,
    head: u16,
    tail: u16,
    paired_queue: Option<u16>,
}

impl Queue {
    pub fn new(
        slot_count: u16,
        queue_id: u16,
        doorbell: Arc<DoorbellRegister>,
        memory_address: u64,
        entry_bytes: usize,
    ) -> Result<Self, QueueError> {
        if slot_count < 2 {
            return Err(QueueError::InvalidQueueSize(slot_count));
        }
        Ok(Self {
            queue_id,
            slot_count,
            entry_bytes,
            memory_address,
            doorbell,
            head: 0,
            tail: 0,
            paired_queue: None,
        })
    }

    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    pub fn slot_count(&self) -> u16 {
        self.slot_count
    }

    pub fn head(&self) -> u16 {
        self.head
    }

    pub fn tail(&self) -> u16 {
        self.tail
    }

    pub fn memory_address(&self) -> u64 {
        self.memory_address
    }

    pub fn doorbell(&self) -> &DoorbellRegister {
        &self.doorbell
    }

    pub fn paired_queue(&self) -> Option<u16> {
        self.paired_queue
    }

    pub fn set_paired_queue(&mut self, queue_id: u16) {
        self.paired_queue = Some(queue_id);
    }

    /// Rebases the ring, as when the host reprograms ASQ/ACQ while the admin
    /// queue already exists. Cursors are unaffected.
    pub fn set_memory_address(&mut self, memory_address: u64) {
        self.memory_address = memory_address;
    }

    /// Accepts a host-advanced tail. Returns false without updating anything
    /// when the value does not address a slot.
    pub fn set_tail(&mut self, tail: u16) -> bool {
        if tail >= self.slot_count {
            return false;
        }
        self.tail = tail;
        true
    }

    /// Moves the head one slot toward the tail, wrapping at the ring end.
    /// Callers check `head != tail` first.
    pub fn advance_head(&mut self) {
        self.head = advance(self.head, self.slot_count);
    }

    pub fn memory_size(&self) -> usize {
        self.slot_count as usize * self.entry_bytes
    }

    pub fn slot_address(&self, index: u16) -> u64 {
        self.memory_address
            .wrapping_add(index as u64 * self.entry_bytes as u64)
    }
}

fn advance(n: u16, l: u16) -> u16 {
    if n + 1 < l {
        n + 1
    } else {
        0
    }
}
