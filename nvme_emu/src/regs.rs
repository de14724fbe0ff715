// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The controller register block and its doorbell array.
//!
//! The host drives this block through [`read_bar0`](ControllerRegisters::read_bar0)
//! and [`write_bar0`](ControllerRegisters::write_bar0); the engine reads the
//! typed accessors each tick. The register file is decoded at dword
//! granularity: an 8-byte access is two consecutive dwords, and the wide
//! registers (CAP, ASQ, ACQ) hand out and take their halves independently.
//! Queue doorbells start at `DOORBELL_BASE`, laid out flat as
//! `[SQ0T, CQ0H, SQ1T, CQ1H, ..]`.

use crate::queue::DoorbellRegister;
use crate::spec;
use crate::DOORBELL_STRIDE_BITS;
use crate::MAX_QES;
use crate::NVME_VERSION;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("invalid register offset {0:#x}")]
    InvalidRegister(u64),
    #[error("invalid access size")]
    InvalidAccessSize,
    #[error("unaligned access")]
    UnalignedAccess,
}

/// Capabilities advertised to the host: contiguous queues required, strict
/// round-robin arbitration only, the NVM command set, a four-byte doorbell
/// stride, and the full CC.MPS range.
fn capabilities() -> spec::Cap {
    spec::Cap::new()
        .with_mqes_z(MAX_QES - 1)
        .with_cqr(true)
        .with_to(0xff)
        .with_dstrd(DOORBELL_STRIDE_BITS - 2)
        .with_css_nvm(true)
        .with_mpsmax(0xf)
}

struct RegState {
    cc: spec::Cc,
    csts: spec::Csts,
    aqa: spec::Aqa,
    asq: u64,
    acq: u64,
}

impl RegState {
    fn new() -> Self {
        Self {
            cc: spec::Cc::new(),
            csts: spec::Csts::new(),
            aqa: spec::Aqa::new(),
            asq: 0,
            acq: 0,
        }
    }

    /// Reads one dword of the register file.
    fn read_dword(&self, offset: u16) -> Option<u32> {
        let wide = match spec::Register(offset & !4) {
            spec::Register::CAP => Some(u64::from(capabilities())),
            spec::Register::ASQ => Some(self.asq),
            spec::Register::ACQ => Some(self.acq),
            _ => None,
        };
        if let Some(value) = wide {
            return Some(dword_of(value, offset & 4 != 0));
        }
        let value = match spec::Register(offset) {
            spec::Register::VS => NVME_VERSION,
            spec::Register::CC => self.cc.into(),
            spec::Register::CSTS => self.csts.into(),
            spec::Register::NSSR => 0,
            spec::Register::AQA => self.aqa.into(),
            _ => return None,
        };
        Some(value)
    }
}

/// The memory-mapped controller register block.
pub struct ControllerRegisters {
    state: Mutex<RegState>,
    doorbells: Vec<Arc<DoorbellRegister>>,
    reset_requested: AtomicBool,
}

impl ControllerRegisters {
    pub(crate) fn new(max_queues: u16) -> Self {
        let doorbells = (0..max_queues as usize * 2)
            .map(|_| Arc::new(DoorbellRegister::new()))
            .collect();
        Self {
            state: Mutex::new(RegState::new()),
            doorbells,
            reset_requested: AtomicBool::new(false),
        }
    }

    pub fn csts(&self) -> spec::Csts {
        self.state.lock().csts
    }

    pub fn aqa(&self) -> spec::Aqa {
        self.state.lock().aqa
    }

    pub fn asq(&self) -> u64 {
        self.state.lock().asq
    }

    pub fn acq(&self) -> u64 {
        self.state.lock().acq
    }

    /// The page size PRPs are carved into, derived from CC.MPS. Zero while
    /// the controller is not ready, which callers treat as the register
    /// block having been torn down under them.
    pub fn memory_page_size(&self) -> u32 {
        let state = self.state.lock();
        if !state.csts.rdy() {
            return 0;
        }
        1u32 << (12 + state.cc.mps() as u32)
    }

    pub(crate) fn sq_tail_doorbell(&self, queue_id: u16) -> Option<Arc<DoorbellRegister>> {
        self.doorbells.get(queue_id as usize * 2).cloned()
    }

    pub(crate) fn cq_head_doorbell(&self, queue_id: u16) -> Option<Arc<DoorbellRegister>> {
        self.doorbells.get(queue_id as usize * 2 + 1).cloned()
    }

    /// Hands the pending reset request, if any, to the engine. The engine
    /// drains this at the top of its next tick so the reset executes on the
    /// engine's context.
    pub(crate) fn take_reset_request(&self) -> bool {
        self.reset_requested.swap(false, Ordering::SeqCst)
    }

    /// Reads from the register block at `addr` (a BAR0 offset).
    pub fn read_bar0(&self, addr: u16, data: &mut [u8]) -> Result<(), RegisterError> {
        check_access(addr, data.len())?;
        let state = self.state.lock();
        for (i, chunk) in data.chunks_exact_mut(4).enumerate() {
            let offset = addr + i as u16 * 4;
            let dword = state
                .read_dword(offset)
                .ok_or(RegisterError::InvalidRegister(offset.into()))?;
            chunk.copy_from_slice(&dword.to_ne_bytes());
        }
        Ok(())
    }

    /// Writes to the register block at `addr` (a BAR0 offset). Offsets at or
    /// beyond `DOORBELL_BASE` are doorbell rings.
    pub fn write_bar0(&self, addr: u16, data: &[u8]) -> Result<(), RegisterError> {
        if addr >= spec::DOORBELL_BASE {
            return self.ring_doorbell(addr, data);
        }
        check_access(addr, data.len())?;
        let mut state = self.state.lock();
        for (i, chunk) in data.chunks_exact(4).enumerate() {
            let mut dword = [0u8; 4];
            dword.copy_from_slice(chunk);
            self.write_dword(&mut state, addr + i as u16 * 4, u32::from_ne_bytes(dword))?;
        }
        Ok(())
    }

    /// Writes one dword of the register file.
    fn write_dword(
        &self,
        state: &mut RegState,
        offset: u16,
        value: u32,
    ) -> Result<(), RegisterError> {
        let reg = spec::Register(offset & !4);
        if matches!(reg, spec::Register::ASQ | spec::Register::ACQ) {
            if state.cc.en() {
                tracing::warn!(?reg, "attempt to move an admin queue while enabled");
                return Ok(());
            }
            let high = offset & 4 != 0;
            let target = if reg == spec::Register::ASQ {
                &mut state.asq
            } else {
                &mut state.acq
            };
            // Base addresses are page-aligned.
            *target = merge_dword(*target, high, value) & !0xfff;
            return Ok(());
        }

        match spec::Register(offset) {
            spec::Register::CC => self.set_cc(state, value.into()),
            spec::Register::AQA => {
                if state.cc.en() {
                    tracing::warn!("attempt to resize the admin queues while enabled");
                } else {
                    state.aqa = value.into();
                }
            }
            _ => return Err(RegisterError::InvalidRegister(offset.into())),
        }
        Ok(())
    }

    /// Doorbell rings are dword writes at stride spacing past the register
    /// file; even slots are submission tails, odd slots completion heads.
    fn ring_doorbell(&self, addr: u16, data: &[u8]) -> Result<(), RegisterError> {
        let Ok(dword) = <[u8; 4]>::try_from(data) else {
            return Err(RegisterError::InvalidAccessSize);
        };
        let offset = (addr - spec::DOORBELL_BASE) as usize;
        let stride = 1usize << DOORBELL_STRIDE_BITS;
        if offset % stride != 0 {
            return Err(RegisterError::InvalidRegister(addr.into()));
        }
        match self.doorbells.get(offset / stride) {
            Some(doorbell) => {
                doorbell.write(u32::from_ne_bytes(dword) as u16);
                Ok(())
            }
            None => Err(RegisterError::InvalidRegister(addr.into())),
        }
    }

    fn set_cc(&self, state: &mut RegState, requested: spec::Cc) {
        // Writable fields only; everything else reads back zero.
        let cc = spec::Cc::new()
            .with_en(requested.en())
            .with_mps(requested.mps())
            .with_shn(requested.shn())
            .with_iosqes(requested.iosqes())
            .with_iocqes(requested.iocqes());
        tracing::debug!(?cc, "set cc");

        if cc.en() && !state.cc.en() {
            state.csts.set_rdy(true);
            tracing::debug!("controller enabled");
        } else if !cc.en() && state.cc.en() {
            // Host-initiated controller reset. Ready drops immediately; the
            // queue teardown happens on the engine's next tick.
            state.csts.set_rdy(false);
            self.reset_requested.store(true, Ordering::SeqCst);
            tracing::info!("controller reset requested");
        }

        state.cc = cc;
    }
}

fn check_access(addr: u16, len: usize) -> Result<(), RegisterError> {
    if !matches!(len, 4 | 8) {
        return Err(RegisterError::InvalidAccessSize);
    }
    if addr as usize % len != 0 {
        return Err(RegisterError::UnalignedAccess);
    }
    Ok(())
}

fn dword_of(value: u64, high: bool) -> u32 {
    if high {
        (value >> 32) as u32
    } else {
        value as u32
    }
}

fn merge_dword(value: u64, high: bool, dword: u32) -> u64 {
    if high {
        value & u32::MAX as u64 | (dword as u64) << 32
    } else {
        value & !(u32::MAX as u64) | dword as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    fn regs() -> ControllerRegisters {
        ControllerRegisters::new(4)
    }

    fn read32(regs: &ControllerRegisters, addr: u16) -> u32 {
        let mut dword = 0u32;
        regs.read_bar0(addr, dword.as_mut_bytes()).unwrap();
        dword
    }

    #[test]
    fn cap_and_version_read_back() {
        let regs = regs();
        let mut qword = 0u64;
        regs.read_bar0(0x0, qword.as_mut_bytes()).unwrap();
        let cap = spec::Cap::from(qword);
        assert_eq!(cap.mqes_z(), MAX_QES - 1);
        assert!(cap.cqr());
        // The high half is also available as its own dword.
        assert_eq!(read32(&regs, 0x4), (qword >> 32) as u32);
        assert_eq!(read32(&regs, 0x8), NVME_VERSION);
    }

    #[test]
    fn asq_accepts_split_dword_writes() {
        let regs = regs();
        regs.write_bar0(0x28, 0x4000u32.as_bytes()).unwrap();
        regs.write_bar0(0x2c, 0x1u32.as_bytes()).unwrap();
        assert_eq!(regs.asq(), 0x1_0000_4000);
        regs.write_bar0(0x30, 0x2000u64.as_bytes()).unwrap();
        assert_eq!(regs.acq(), 0x2000);
    }

    #[test]
    fn admin_registers_lock_while_enabled() {
        let regs = regs();
        regs.write_bar0(0x28, 0x1000u64.as_bytes()).unwrap();
        regs.write_bar0(0x14, u32::from(spec::Cc::new().with_en(true)).as_bytes())
            .unwrap();
        regs.write_bar0(0x28, 0x9000u64.as_bytes()).unwrap();
        assert_eq!(regs.asq(), 0x1000);
    }

    #[test]
    fn enable_and_disable_drive_ready_and_reset() {
        let regs = regs();
        assert!(!regs.csts().rdy());
        assert_eq!(regs.memory_page_size(), 0);

        regs.write_bar0(0x14, u32::from(spec::Cc::new().with_en(true)).as_bytes())
            .unwrap();
        assert!(regs.csts().rdy());
        assert_eq!(regs.memory_page_size(), 4096);
        assert!(!regs.take_reset_request());

        regs.write_bar0(0x14, 0u32.as_bytes()).unwrap();
        assert!(!regs.csts().rdy());
        assert!(regs.take_reset_request());
        assert!(!regs.take_reset_request());
    }

    #[test]
    fn larger_page_sizes_follow_cc_mps() {
        let regs = regs();
        let cc = spec::Cc::new().with_en(true).with_mps(1);
        regs.write_bar0(0x14, u32::from(cc).as_bytes()).unwrap();
        assert_eq!(regs.memory_page_size(), 8192);
    }

    #[test]
    fn doorbell_writes_land_in_the_array() {
        let regs = regs();
        regs.write_bar0(spec::DOORBELL_BASE, 3u32.as_bytes()).unwrap();
        regs.write_bar0(spec::DOORBELL_BASE + 4, 7u32.as_bytes())
            .unwrap();
        assert_eq!(regs.sq_tail_doorbell(0).unwrap().read(), 3);
        assert_eq!(regs.cq_head_doorbell(0).unwrap().read(), 7);
        assert!(regs.write_bar0(spec::DOORBELL_BASE + 2, 1u32.as_bytes()).is_err());
    }
}
