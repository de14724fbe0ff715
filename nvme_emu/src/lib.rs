// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An emulated NVMe controller for exercising host-side NVMe software.
//!
//! The emulation exposes the register and queue interface a host driver
//! expects: the host programs the admin queue registers, enables the
//! controller, and rings doorbells; the controller consumes commands from
//! submission rings in host memory and posts completions with phase-tag
//! management. There is no backing media.

#![forbid(unsafe_code)]

mod controller;
mod error;
mod pci;
mod prp;
mod queue;
mod regs;
mod worker;

#[cfg(test)]
mod tests;

pub use controller::NvmeController;
pub use hostmem::HostMemory;
pub use regs::ControllerRegisters;
pub use regs::RegisterError;

use nvme_emu_spec as spec;
use std::time::Duration;

/// Queue id of the admin submission/completion pair.
const ADMIN_QUEUE_ID: u16 = 0;
const DOORBELL_STRIDE_BITS: u8 = 2;
const VENDOR_ID: u16 = 0x1414;
const NVME_VERSION: u32 = 0x00020000;
const MAX_QES: u16 = 256;
/// Queue ids the doorbell array leaves room for, admin pair included.
const MAX_QUEUES: u16 = 64;
const BAR0_LEN: u64 = 0x10000;

/// Interval between doorbell polls in worker mode.
const CHANGE_CHECK_SLEEP: Duration = Duration::from_millis(10);
