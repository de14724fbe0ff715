// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Helpers shared by the controller tests.

use crate::spec;
use crate::NvmeController;
use hostmem::HostMemory;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Admin queue placement used throughout the tests.
pub const ASQ_BASE: u64 = 0x1000;
pub const ACQ_BASE: u64 = 0x2000;
pub const DATA_BASE: u64 = 0x10000;

pub fn test_memory() -> HostMemory {
    HostMemory::allocate(0x20000)
}

/// Programs the admin queue registers and enables the controller. Sizes are
/// zero-based, as in AQA.
pub fn program_admin_queues(controller: &NvmeController, asqs_z: u16, acqs_z: u16) {
    let regs = controller.registers();
    regs.write_bar0(0x28, ASQ_BASE.as_bytes()).unwrap();
    regs.write_bar0(0x30, ACQ_BASE.as_bytes()).unwrap();
    let aqa = asqs_z as u32 | (acqs_z as u32) << 16;
    regs.write_bar0(0x24, aqa.as_bytes()).unwrap();
    enable_controller(controller);
}

pub fn enable_controller(controller: &NvmeController) {
    let regs = controller.registers();
    let mut cc = 0u32;
    regs.read_bar0(0x14, cc.as_mut_bytes()).unwrap();
    cc |= 1;
    regs.write_bar0(0x14, cc.as_bytes()).unwrap();
}

pub fn disable_controller(controller: &NvmeController) {
    let regs = controller.registers();
    let mut cc = 0u32;
    regs.read_bar0(0x14, cc.as_mut_bytes()).unwrap();
    cc &= !1;
    regs.write_bar0(0x14, cc.as_bytes()).unwrap();
}

/// A controller in cooperative mode with a 16-entry admin pair, ticked once
/// so the pair is materialized.
pub fn build_admin_controller(mem: &HostMemory) -> NvmeController {
    let controller = NvmeController::new_manual(mem.clone());
    program_admin_queues(&controller, 15, 15);
    controller.process_changes();
    controller
}

pub fn keep_alive_command(cid: u16) -> spec::Command {
    let mut command = spec::Command::new_zeroed();
    command.cdw0.set_opcode(spec::AdminOpcode::KEEP_ALIVE.0);
    command.cdw0.set_cid(cid);
    command
}

pub fn identify_command(cid: u16, dptr: u64) -> spec::Command {
    let mut command = spec::Command::new_zeroed();
    command.cdw0.set_opcode(spec::AdminOpcode::IDENTIFY.0);
    command.cdw0.set_cid(cid);
    command.cdw10 = spec::Cdw10Identify::new()
        .with_cns(spec::Cns::CONTROLLER.0)
        .into();
    command.dptr[0] = dptr;
    command
}

pub fn write_command(mem: &HostMemory, sq_base: u64, slot: u16, command: &spec::Command) {
    mem.write_plain(sq_base + slot as u64 * 64, command).unwrap();
}

pub fn read_completion(mem: &HostMemory, cq_base: u64, slot: u16) -> spec::Completion {
    mem.read_plain(cq_base + slot as u64 * 16).unwrap()
}

/// Rings the submission queue tail doorbell for `queue_id`.
pub fn ring_sq_doorbell(controller: &NvmeController, queue_id: u16, tail: u16) {
    let offset = spec::DOORBELL_BASE + queue_id * 8;
    controller
        .registers()
        .write_bar0(offset, (tail as u32).as_bytes())
        .unwrap();
}
