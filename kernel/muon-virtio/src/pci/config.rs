//! Standard PCI configuration-space registers.

use muon_driver_api::{PciAddress, PciConfigAccess};

/// Standard configuration space register offsets.
pub mod regs {
    /// Vendor ID (16-bit, offset 0x00).
    pub const VENDOR_ID: u8 = 0x00;
    /// Device ID (16-bit, offset 0x02).
    pub const DEVICE_ID: u8 = 0x02;
    /// Command register (16-bit, offset 0x04).
    pub const COMMAND: u8 = 0x04;
    /// Status register (16-bit, offset 0x06).
    pub const STATUS: u8 = 0x06;
    /// Base Address Register 0 (32-bit, offset 0x10). BAR1-5 at +4 intervals.
    pub const BAR0: u8 = 0x10;
    /// Capabilities Pointer (8-bit, offset 0x34).
    pub const CAPABILITIES_PTR: u8 = 0x34;
    /// Interrupt Pin (8-bit, offset 0x3D). 1 = INTA# .. 4 = INTD#.
    pub const INTERRUPT_PIN: u8 = 0x3D;

    /// Bit 4 of the Status register: capabilities list present.
    pub const STATUS_CAPABILITIES_LIST: u16 = 1 << 4;

    /// Vendor-specific capability ID (used by VirtIO PCI).
    pub const CAP_ID_VENDOR: u8 = 0x09;
    /// MSI-X capability ID.
    pub const CAP_ID_MSIX: u8 = 0x11;
}

bitflags::bitflags! {
    /// Command register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Command: u16 {
        /// I/O space decoding enabled.
        const IO_SPACE = 1 << 0;
        /// Memory space decoding enabled.
        const MEMORY_SPACE = 1 << 1;
        /// Device may initiate DMA.
        const BUS_MASTER = 1 << 2;
        /// Legacy INTx assertion disabled.
        const INTERRUPT_DISABLE = 1 << 10;
    }
}

/// Enables memory-space decoding and bus mastering and re-enables INTx.
pub fn enable_device(cfg: &mut dyn PciConfigAccess, addr: PciAddress) {
    let mut cmd = Command::from_bits_truncate(cfg.read_u16(addr, regs::COMMAND));
    cmd |= Command::MEMORY_SPACE | Command::BUS_MASTER;
    cmd &= !Command::INTERRUPT_DISABLE;
    cfg.write_u16(addr, regs::COMMAND, cmd.bits());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakePciFunction, FakePciHost};

    #[test]
    fn enable_sets_command_bits() {
        let addr = PciAddress::new(0, 3, 0);
        let mut host = FakePciHost::new();
        let mut f = FakePciFunction::new(0x1AF4, 0x1042);
        f.set_interrupt_pin(1);
        host.insert(addr, f);

        // Pre-set INTERRUPT_DISABLE to verify it gets cleared.
        host.write_u16(addr, regs::COMMAND, Command::INTERRUPT_DISABLE.bits());
        enable_device(&mut host, addr);

        let cmd = Command::from_bits_truncate(host.read_u16(addr, regs::COMMAND));
        assert!(cmd.contains(Command::MEMORY_SPACE | Command::BUS_MASTER));
        assert!(!cmd.contains(Command::INTERRUPT_DISABLE));
    }
}
