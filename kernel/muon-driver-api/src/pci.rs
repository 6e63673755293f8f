//! PCI bus types and the configuration-space access contract.

use core::fmt;

/// PCI bus/device/function address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    /// Bus number (0-255).
    pub bus: u8,
    /// Device number (0-31).
    pub device: u8,
    /// Function number (0-7).
    pub function: u8,
}

impl PciAddress {
    /// Creates an address from bus/device/function components.
    #[must_use]
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// A decoded Base Address Register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PciBar {
    /// BAR slot not implemented by the device.
    #[default]
    Unused,
    /// Memory-mapped register window.
    Memory {
        /// Assigned bus address.
        base: u64,
        /// Window size in bytes (a power of two).
        size: u64,
        /// Prefetchable memory.
        prefetchable: bool,
        /// 64-bit BAR (consumes the following slot as well).
        is_64bit: bool,
    },
    /// Legacy I/O-port window. Not used by this stack.
    Io {
        /// Port base.
        base: u32,
        /// Window size in bytes.
        size: u32,
    },
}

/// Device information gathered during discovery.
#[derive(Debug, Clone, Copy)]
pub struct PciDeviceInfo {
    /// Bus/device/function address.
    pub address: PciAddress,
    /// Vendor ID.
    pub vendor_id: u16,
    /// Device ID.
    pub device_id: u16,
    /// Interrupt pin (1 = INTA# .. 4 = INTD#, 0 = none).
    pub interrupt_pin: u8,
    /// Decoded and assigned BARs.
    pub bars: [PciBar; 6],
}

/// PCI configuration-space access, provided by the platform.
///
/// The stack reaches configuration space only through this trait; the
/// mechanism behind it (port CAM, ECAM, an emulated space in tests) is the
/// platform's business. Only the 32-bit accessors are required — the
/// narrower widths are derived from dword accesses the same way a port-CAM
/// implementation would.
pub trait PciConfigAccess {
    /// Reads a 32-bit value. `offset` must be dword-aligned.
    fn read_u32(&self, addr: PciAddress, offset: u8) -> u32;

    /// Writes a 32-bit value. `offset` must be dword-aligned.
    fn write_u32(&mut self, addr: PciAddress, offset: u8, value: u32);

    /// Reads a 16-bit value.
    fn read_u16(&self, addr: PciAddress, offset: u8) -> u16 {
        let dword = self.read_u32(addr, offset & 0xFC);
        let shift = u32::from(offset & 2) * 8;
        (dword >> shift) as u16
    }

    /// Reads an 8-bit value.
    fn read_u8(&self, addr: PciAddress, offset: u8) -> u8 {
        let dword = self.read_u32(addr, offset & 0xFC);
        let shift = u32::from(offset & 3) * 8;
        (dword >> shift) as u8
    }

    /// Writes a 16-bit value (read-modify-write of the containing dword).
    fn write_u16(&mut self, addr: PciAddress, offset: u8, value: u16) {
        let aligned = offset & 0xFC;
        let shift = u32::from(offset & 2) * 8;
        let mut dword = self.read_u32(addr, aligned);
        dword &= !(0xFFFF << shift);
        dword |= u32::from(value) << shift;
        self.write_u32(addr, aligned, dword);
    }

    /// Writes an 8-bit value (read-modify-write of the containing dword).
    fn write_u8(&mut self, addr: PciAddress, offset: u8, value: u8) {
        let aligned = offset & 0xFC;
        let shift = u32::from(offset & 3) * 8;
        let mut dword = self.read_u32(addr, aligned);
        dword &= !(0xFF << shift);
        dword |= u32::from(value) << shift;
        self.write_u32(addr, aligned, dword);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A 256-byte config space backed by plain memory.
    struct FlatSpace([u8; 256]);

    impl PciConfigAccess for FlatSpace {
        fn read_u32(&self, _addr: PciAddress, offset: u8) -> u32 {
            let o = offset as usize & 0xFC;
            u32::from_le_bytes(self.0[o..o + 4].try_into().unwrap())
        }

        fn write_u32(&mut self, _addr: PciAddress, offset: u8, value: u32) {
            let o = offset as usize & 0xFC;
            self.0[o..o + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    #[test]
    fn address_display() {
        let addr = PciAddress::new(0, 0x1f, 2);
        assert_eq!(format!("{addr}"), "00:1f.2");
    }

    #[test]
    fn narrow_accessors_derive_from_dwords() {
        let mut space = FlatSpace([0; 256]);
        let addr = PciAddress::new(0, 0, 0);
        space.write_u32(addr, 0x10, 0xAABB_CCDD);
        assert_eq!(space.read_u16(addr, 0x10), 0xCCDD);
        assert_eq!(space.read_u16(addr, 0x12), 0xAABB);
        assert_eq!(space.read_u8(addr, 0x13), 0xAA);

        space.write_u16(addr, 0x12, 0x1122);
        assert_eq!(space.read_u32(addr, 0x10), 0x1122_CCDD);
        space.write_u8(addr, 0x10, 0xEE);
        assert_eq!(space.read_u32(addr, 0x10), 0x1122_CCEE);
    }
}
