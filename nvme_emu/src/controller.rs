// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The controller engine: doorbell observation, queue lifecycle, command
//! dispatch, completion production, and reset.

use crate::error::CommandResult;
use crate::error::NvmeError;
use crate::pci::PciExpressRegisters;
use crate::prp::PrpRange;
use crate::queue::Queue;
use crate::queue::CQ_ENTRY_BYTES;
use crate::queue::SQ_ENTRY_BYTES;
use crate::regs::ControllerRegisters;
use crate::regs::RegisterError;
use crate::spec;
use crate::worker::TickWorker;
use crate::ADMIN_QUEUE_ID;
use crate::BAR0_LEN;
use crate::CHANGE_CHECK_SLEEP;
use crate::MAX_QUEUES;
use hostmem::HostMemory;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::error::Error;
use std::sync::Arc;

/// Size of the per-queue command identifier space.
const MAX_COMMAND_IDENTIFIER: usize = 65536;

/// An emulated NVMe controller.
///
/// In worker mode ([`NvmeController::new`]) a doorbell watcher thread polls
/// for register and doorbell changes. In cooperative mode
/// ([`NvmeController::new_manual`]) the embedder drives the controller by
/// calling [`NvmeController::process_changes`].
pub struct NvmeController {
    shared: Arc<ControllerShared>,
    watcher: Option<TickWorker>,
}

struct ControllerShared {
    mem: HostMemory,
    pci: Mutex<PciExpressRegisters>,
    regs: Arc<ControllerRegisters>,
    engine: Mutex<Engine>,
}

/// All state the drain loop operates on. Owned by the engine; only the
/// doorbell registers are shared with the host.
#[derive(Default)]
pub(crate) struct Engine {
    pub(crate) valid_submission_queues: Vec<Queue>,
    pub(crate) valid_completion_queues: Vec<Queue>,
    pub(crate) outstanding_cids: BTreeMap<u16, BTreeSet<u16>>,
    pub(crate) phase_tags: BTreeMap<u16, bool>,
}

/// A structural failure that defers the rest of this tick's drain.
struct DrainAborted;

impl NvmeController {
    /// Creates a controller and spawns its doorbell watcher.
    pub fn new(mem: HostMemory) -> Self {
        let mut controller = Self::new_manual(mem);
        let shared = controller.shared.clone();
        controller.watcher = Some(TickWorker::spawn(CHANGE_CHECK_SLEEP, move || {
            shared.check_for_changes()
        }));
        controller
    }

    /// Creates a controller in cooperative mode; no thread is spawned.
    pub fn new_manual(mem: HostMemory) -> Self {
        Self {
            shared: Arc::new(ControllerShared {
                mem,
                pci: Mutex::new(PciExpressRegisters::new()),
                regs: Arc::new(ControllerRegisters::new(MAX_QUEUES)),
                engine: Mutex::new(Engine::default()),
            }),
            watcher: None,
        }
    }

    pub fn registers(&self) -> &ControllerRegisters {
        &self.shared.regs
    }

    pub fn pci_cfg_read(&self, offset: u16) -> Result<u32, RegisterError> {
        self.shared.pci.lock().cfg_read(offset)
    }

    pub fn pci_cfg_write(&self, offset: u16, value: u32) -> Result<(), RegisterError> {
        self.shared.pci.lock().cfg_write(offset, value)
    }

    /// Accesses the register block by absolute address, translating through
    /// the BAR0 base the host programmed into PCI config space.
    pub fn mmio_read(&self, addr: u64, data: &mut [u8]) -> Result<(), RegisterError> {
        let offset = self.bar0_offset(addr)?;
        self.shared.regs.read_bar0(offset, data)
    }

    pub fn mmio_write(&self, addr: u64, data: &[u8]) -> Result<(), RegisterError> {
        let offset = self.bar0_offset(addr)?;
        self.shared.regs.write_bar0(offset, data)
    }

    fn bar0_offset(&self, addr: u64) -> Result<u16, RegisterError> {
        let base = self.shared.pci.lock().bar0_address();
        match addr.checked_sub(base) {
            Some(offset) if offset < BAR0_LEN => Ok(offset as u16),
            _ => Err(RegisterError::InvalidRegister(addr)),
        }
    }

    /// Runs one doorbell pass synchronously.
    pub fn process_changes(&self) {
        self.shared.check_for_changes();
    }

    /// Waits for a full doorbell pass: the watcher's next completed tick in
    /// worker mode, a synchronous pass in cooperative mode.
    pub fn wait_for_change_pass(&self) {
        match &self.watcher {
            Some(watcher) => watcher.wait_for_tick(),
            None => self.process_changes(),
        }
    }

    /// Stops the doorbell watcher, completing any tick in flight first.
    pub fn shutdown(mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
    }

    #[cfg(test)]
    pub(crate) fn engine(&self) -> parking_lot::MutexGuard<'_, Engine> {
        self.shared.engine.lock()
    }
}

impl ControllerShared {
    fn check_for_changes(&self) {
        let mut engine = self.engine.lock();
        if self.regs.take_reset_request() {
            engine.controller_reset();
        }
        engine.check_for_changes(&self.mem, &self.regs);
    }
}

impl Engine {
    /// One pass of the doorbell observer: gate on readiness, materialize or
    /// rebase the admin pair, then drain every submission queue in registry
    /// order.
    fn check_for_changes(&mut self, mem: &HostMemory, regs: &ControllerRegisters) {
        if !regs.csts().rdy() {
            return;
        }

        let asq = regs.asq();
        if asq == 0 {
            return;
        }
        let aqa = regs.aqa();
        if self.valid_submission_queues.is_empty() {
            let Some(doorbell) = regs.sq_tail_doorbell(ADMIN_QUEUE_ID) else {
                return;
            };
            match Queue::new(
                aqa.asqs_z() + 1,
                ADMIN_QUEUE_ID,
                doorbell,
                asq,
                SQ_ENTRY_BYTES,
            ) {
                Ok(queue) => self.valid_submission_queues.push(queue),
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn Error,
                        "admin submission queue not materialized"
                    );
                    return;
                }
            }
        } else {
            let Some(queue) =
                queue_with_id_mut(&mut self.valid_submission_queues, ADMIN_QUEUE_ID)
            else {
                debug_assert!(false, "admin submission queue missing");
                tracing::error!("admin submission queue missing from registry");
                return;
            };
            queue.set_memory_address(asq);
        }

        let acq = regs.acq();
        if acq == 0 {
            return;
        }
        if self.valid_completion_queues.is_empty() {
            let Some(doorbell) = regs.cq_head_doorbell(ADMIN_QUEUE_ID) else {
                return;
            };
            match Queue::new(
                aqa.acqs_z() + 1,
                ADMIN_QUEUE_ID,
                doorbell,
                acq,
                CQ_ENTRY_BYTES,
            ) {
                Ok(mut queue) => {
                    queue.set_paired_queue(ADMIN_QUEUE_ID);
                    self.valid_completion_queues.push(queue);
                    if let Some(sq) =
                        queue_with_id_mut(&mut self.valid_submission_queues, ADMIN_QUEUE_ID)
                    {
                        sq.set_paired_queue(ADMIN_QUEUE_ID);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn Error,
                        "admin completion queue not materialized"
                    );
                    return;
                }
            }
        } else {
            let Some(queue) =
                queue_with_id_mut(&mut self.valid_completion_queues, ADMIN_QUEUE_ID)
            else {
                debug_assert!(false, "admin completion queue missing");
                tracing::error!("admin completion queue missing from registry");
                return;
            };
            queue.set_memory_address(acq);
        }

        self.drain_submission_queues(mem, regs);
    }

    /// Visits submission queues in registry order, consuming any backlog the
    /// host has announced through the tail doorbells.
    fn drain_submission_queues(&mut self, mem: &HostMemory, regs: &ControllerRegisters) {
        for sq_index in 0..self.valid_submission_queues.len() {
            let sq = &self.valid_submission_queues[sq_index];
            let sqid = sq.queue_id();
            let doorbell_tail = sq.doorbell().read();
            if doorbell_tail == sq.tail() {
                continue;
            }

            let Some(cq_index) = sq
                .paired_queue()
                .and_then(|id| queue_index_with_id(&self.valid_completion_queues, id))
            else {
                // Leave the queue untouched until it gets a pair.
                tracing::error!(sqid, "submission queue received a command with no completion pair");
                continue;
            };

            if !self.valid_submission_queues[sq_index].set_tail(doorbell_tail) {
                // A real controller would raise an asynchronous event here.
                tracing::warn!(sqid, tail = doorbell_tail, "invalid doorbell tail");
                continue;
            }
            if !self.valid_completion_queues[cq_index].set_tail(doorbell_tail) {
                tracing::warn!(sqid, tail = doorbell_tail, "tail exceeds completion ring");
            }

            while self.valid_submission_queues[sq_index].head()
                != self.valid_submission_queues[sq_index].tail()
            {
                if self
                    .process_command(mem, regs, sq_index, cq_index)
                    .is_err()
                {
                    return;
                }
            }
        }
    }

    /// Consumes the command at the head of one submission queue and posts
    /// its completion.
    fn process_command(
        &mut self,
        mem: &HostMemory,
        regs: &ControllerRegisters,
        sq_index: usize,
        cq_index: usize,
    ) -> Result<(), DrainAborted> {
        let sq = &mut self.valid_submission_queues[sq_index];
        let sqid = sq.queue_id();
        let command: spec::Command = match mem.read_plain(sq.slot_address(sq.head())) {
            Ok(command) => command,
            Err(err) => {
                tracing::error!(error = &err as &dyn Error, sqid, "failed to read command");
                return Err(DrainAborted);
            }
        };
        let cid = command.cdw0.cid();

        // Read before the slot is consumed or the identifier recorded: an
        // aborted drain leaves the head in place so the command is retried
        // on a later tick.
        let memory_page_size = regs.memory_page_size();
        if memory_page_size == 0 {
            tracing::error!("no memory page size; controller registers lost");
            return Err(DrainAborted);
        }

        sq.advance_head();
        let sqhd = sq.head();

        if !self.is_valid_command_identifier(cid, sqid) {
            return self.post_completion(
                mem,
                cq_index,
                sqid,
                sqhd,
                cid,
                spec::Status::COMMAND_ID_CONFLICT.into(),
            );
        }

        let result = if sqid == ADMIN_QUEUE_ID {
            self.execute_admin(mem, memory_page_size, &command)
        } else {
            let opcode = spec::NvmOpcode(command.cdw0.opcode());
            tracing::warn!(sqid, ?opcode, "unsupported nvm opcode");
            spec::Status::INVALID_COMMAND_OPCODE.into()
        };
        self.post_completion(mem, cq_index, sqid, sqhd, cid, result)
    }

    fn execute_admin(
        &self,
        mem: &HostMemory,
        memory_page_size: u32,
        command: &spec::Command,
    ) -> CommandResult {
        let opcode = spec::AdminOpcode(command.cdw0.opcode());
        tracing::debug!(?opcode, cid = command.cdw0.cid(), "admin command");
        match opcode {
            spec::AdminOpcode::IDENTIFY => identify(mem, memory_page_size, command)
                .map(|()| CommandResult::default())
                .unwrap_or_else(CommandResult::from),
            spec::AdminOpcode::KEEP_ALIVE => CommandResult::default(),
            _ => {
                tracing::warn!(?opcode, "unsupported admin opcode");
                spec::Status::INVALID_COMMAND_OPCODE.into()
            }
        }
    }

    /// Tracks outstanding command identifiers per submission queue. An
    /// identifier that is still outstanding is always a conflict; only a
    /// fresh identifier arriving at a saturated set restarts tracking, on
    /// the presumption that older commands have retired.
    pub(crate) fn is_valid_command_identifier(&mut self, cid: u16, sqid: u16) -> bool {
        let cids = self.outstanding_cids.entry(sqid).or_default();
        if cids.contains(&cid) {
            tracing::warn!(cid, sqid, "command identifier already outstanding");
            return false;
        }
        if cids.len() == MAX_COMMAND_IDENTIFIER {
            tracing::debug!(sqid, "command identifier space exhausted, restarting tracking");
            cids.clear();
        }
        cids.insert(cid);
        true
    }

    /// Composes a completion entry and delivers it to the completion queue,
    /// then signals the host through the CQ head doorbell. The entry bytes
    /// are fully written before the doorbell store.
    fn post_completion(
        &mut self,
        mem: &HostMemory,
        cq_index: usize,
        sqid: u16,
        sqhd: u16,
        cid: u16,
        result: CommandResult,
    ) -> Result<(), DrainAborted> {
        let phase = {
            let cq = &self.valid_completion_queues[cq_index];
            let tag = self.phase_tags.entry(sqid).or_insert(false);
            if cq.head() == 0 {
                *tag = !*tag;
                tracing::debug!(sqid, phase = *tag, "phase tag inverted");
            }
            *tag
        };

        let dnr = matches!(
            result.status,
            spec::Status::COMMAND_ID_CONFLICT | spec::Status::INVALID_COMMAND_OPCODE
        );
        let completion = spec::Completion {
            dw0: result.dw[0],
            dw1: result.dw[1],
            sqhd,
            sqid,
            cid,
            status: spec::CompletionStatus::new()
                .with_status(result.status.0)
                .with_dnr(dnr)
                .with_phase(phase),
        };

        let cq = &mut self.valid_completion_queues[cq_index];
        let remaining = cq.memory_size() - cq.head() as usize * CQ_ENTRY_BYTES;
        if remaining < CQ_ENTRY_BYTES {
            debug_assert!(false, "completion ring slot overflow");
            tracing::error!(cqid = cq.queue_id(), "completion ring slot overflow");
            return Err(DrainAborted);
        }
        if let Err(err) = mem.write_plain(cq.slot_address(cq.head()), &completion) {
            tracing::error!(
                error = &err as &dyn Error,
                cqid = cq.queue_id(),
                "failed to post completion"
            );
            return Err(DrainAborted);
        }
        cq.advance_head();
        cq.doorbell().write(cq.head());
        Ok(())
    }

    /// Tears down every non-admin queue and forgets identifier and phase
    /// tracking. The admin pair survives with its cursors and addresses.
    fn controller_reset(&mut self) {
        tracing::info!("controller reset");
        self.valid_submission_queues
            .retain(|queue| queue.queue_id() == ADMIN_QUEUE_ID);
        self.valid_completion_queues
            .retain(|queue| queue.queue_id() == ADMIN_QUEUE_ID);
        self.outstanding_cids.clear();
        self.phase_tags.clear();
    }
}

/// Writes the identify data structure out through the command's PRPs. The
/// payload is a placeholder; the leading `0x01, 0xff` marks the structure
/// for host drivers probing the emulation.
fn identify(
    mem: &HostMemory,
    memory_page_size: u32,
    command: &spec::Command,
) -> Result<(), NvmeError> {
    let prp = PrpRange::parse(
        mem,
        memory_page_size as usize,
        command.dptr,
        memory_page_size,
    )?;
    let mut payload = vec![0; prp.len()];
    prp.read(mem, &mut payload)?;
    payload[0] = 0x01;
    payload[1] = 0xff;
    prp.write(mem, &payload)?;
    Ok(())
}

fn queue_with_id_mut(queues: &mut [Queue], queue_id: u16) -> Option<&mut Queue> {
    queues.iter_mut().find(|q| q.queue_id() == queue_id)
}

fn queue_index_with_id(queues: &[Queue], queue_id: u16) -> Option<usize> {
    queues.iter().position(|q| q.queue_id() == queue_id)
}
