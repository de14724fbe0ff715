// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The emulated host address space.
//!
//! Submission rings, completion rings, PRP lists, and data buffers all live
//! in a [`HostMemory`]. The buffer is shared between the controller engine
//! and the emulated host; clones refer to the same storage.
//!
//! Fixed-layout records cross this boundary through the `*_plain` accessors,
//! which rely on [`zerocopy`] layouts. The emulation assumes a little-endian
//! host, matching the NVMe wire format.

#![forbid(unsafe_code)]

use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// An access outside the bounds of the emulated address space.
#[derive(Debug, Error)]
#[error("host memory access out of range: address {addr:#x}, len {len:#x}")]
pub struct HostMemoryError {
    pub addr: u64,
    pub len: usize,
}

/// A byte-addressable emulated host address space.
#[derive(Clone)]
pub struct HostMemory {
    buf: Arc<RwLock<Box<[u8]>>>,
}

impl HostMemory {
    /// Allocates a zeroed address space of `size` bytes.
    pub fn allocate(size: usize) -> Self {
        Self {
            buf: Arc::new(RwLock::new(vec![0; size].into_boxed_slice())),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads `dest.len()` bytes starting at `addr`.
    pub fn read_at(&self, addr: u64, dest: &mut [u8]) -> Result<(), HostMemoryError> {
        let buf = self.buf.read();
        let start = checked_range(addr, dest.len(), buf.len())?;
        dest.copy_from_slice(&buf[start..start + dest.len()]);
        Ok(())
    }

    /// Writes `src` starting at `addr`.
    pub fn write_at(&self, addr: u64, src: &[u8]) -> Result<(), HostMemoryError> {
        let mut buf = self.buf.write();
        let start = checked_range(addr, src.len(), buf.len())?;
        buf[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Fills `len` bytes starting at `addr` with `val`.
    pub fn fill_at(&self, addr: u64, val: u8, len: usize) -> Result<(), HostMemoryError> {
        let mut buf = self.buf.write();
        let start = checked_range(addr, len, buf.len())?;
        buf[start..start + len].fill(val);
        Ok(())
    }

    /// Reads a fixed-layout record at `addr`.
    pub fn read_plain<T: FromBytes + Immutable + KnownLayout>(
        &self,
        addr: u64,
    ) -> Result<T, HostMemoryError> {
        let buf = self.buf.read();
        let len = size_of::<T>();
        let start = checked_range(addr, len, buf.len())?;
        T::read_from_bytes(&buf[start..start + len]).map_err(|_| HostMemoryError { addr, len })
    }

    /// Writes a fixed-layout record at `addr`.
    pub fn write_plain<T: IntoBytes + Immutable + KnownLayout + ?Sized>(
        &self,
        addr: u64,
        value: &T,
    ) -> Result<(), HostMemoryError> {
        self.write_at(addr, value.as_bytes())
    }
}

fn checked_range(addr: u64, len: usize, total: usize) -> Result<usize, HostMemoryError> {
    let end = usize::try_from(addr)
        .ok()
        .and_then(|start| start.checked_add(len));
    match end {
        Some(end) if end <= total => Ok(addr as usize),
        _ => Err(HostMemoryError { addr, len }),
    }
}
