// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A minimal PCI Express configuration model.
//!
//! Supplies the 64-bit BAR0 pair behind which the controller register block
//! sits. The engine does not touch this after construction; the host drives
//! it through the config accessors on the controller.

use crate::regs::RegisterError;
use crate::BAR0_LEN;
use crate::VENDOR_ID;

const DEVICE_ID: u16 = 0x00a9;
/// Mass storage, non-volatile memory, NVMe programming interface.
const CLASS_CODE: u32 = 0x010802;
/// Memory BAR, 64-bit address type.
const MLBAR_TYPE_64BIT: u32 = 0b100;

/// The PCI Express register file.
pub struct PciExpressRegisters {
    mlbar: u32,
    mubar: u32,
    command: u16,
}

impl PciExpressRegisters {
    pub(crate) fn new() -> Self {
        Self {
            mlbar: 0,
            mubar: 0,
            command: 0,
        }
    }

    pub fn cfg_read(&self, offset: u16) -> Result<u32, RegisterError> {
        let value = match offset {
            0x00 => (DEVICE_ID as u32) << 16 | VENDOR_ID as u32,
            0x04 => self.command as u32,
            0x08 => CLASS_CODE << 8,
            0x10 => self.mlbar | MLBAR_TYPE_64BIT,
            0x14 => self.mubar,
            _ => return Err(RegisterError::InvalidRegister(offset.into())),
        };
        Ok(value)
    }

    pub fn cfg_write(&mut self, offset: u16, value: u32) -> Result<(), RegisterError> {
        match offset {
            0x04 => self.command = value as u16,
            0x10 => self.mlbar = value & !(BAR0_LEN as u32 - 1),
            0x14 => self.mubar = value,
            _ => return Err(RegisterError::InvalidRegister(offset.into())),
        }
        Ok(())
    }

    /// The base address of BAR0. The upper BAR contributes the high dword of
    /// the 64-bit address.
    pub fn bar0_address(&self) -> u64 {
        self.mlbar as u64 | (self.mubar as u64) << 32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar0_combines_both_dwords() {
        let mut pci = PciExpressRegisters::new();
        pci.cfg_write(0x10, 0xfe01_0000).unwrap();
        pci.cfg_write(0x14, 0x2).unwrap();
        assert_eq!(pci.bar0_address(), 0x2_fe01_0000);
    }

    #[test]
    fn bar0_low_bits_read_back_with_type() {
        let mut pci = PciExpressRegisters::new();
        pci.cfg_write(0x10, 0xfe01_0007).unwrap();
        assert_eq!(pci.cfg_read(0x10).unwrap(), 0xfe01_0000 | MLBAR_TYPE_64BIT);
        assert_eq!(pci.cfg_read(0x00).unwrap(), 0x00a9_1414);
    }
}
