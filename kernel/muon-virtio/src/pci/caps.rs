//! PCI capability linked-list walker.
//!
//! Walks the capability list starting from the Capabilities Pointer
//! register (offset 0x34), parsing each capability header. The VirtIO PCI
//! transport uses vendor-specific capabilities (cap ID 0x09) to locate its
//! register windows.

use muon_driver_api::{PciAddress, PciConfigAccess};

use super::config::regs;

/// A raw PCI capability header: capability ID and its config-space offset.
#[derive(Debug, Clone, Copy)]
pub struct RawCapability {
    /// PCI capability ID (e.g., 0x09 for vendor-specific).
    pub id: u8,
    /// Config-space offset of this capability header.
    pub offset: u8,
}

/// Iterator over PCI capabilities in a device's config space.
pub struct CapabilityIter<'a> {
    cfg: &'a dyn PciConfigAccess,
    addr: PciAddress,
    next_offset: u8,
}

impl Iterator for CapabilityIter<'_> {
    type Item = RawCapability;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next_offset != 0 {
            let offset = self.next_offset & 0xFC; // dword-aligned
            if offset == 0 {
                break;
            }

            let id = self.cfg.read_u8(self.addr, offset);
            let next = self.cfg.read_u8(self.addr, offset + 1);
            self.next_offset = next;

            return Some(RawCapability { id, offset });
        }
        None
    }
}

/// Returns an iterator over all PCI capabilities for the given device.
///
/// Returns `None` if the device does not have a capabilities list (status
/// register bit 4 is clear).
pub fn walk_capabilities(
    cfg: &dyn PciConfigAccess,
    addr: PciAddress,
) -> Option<CapabilityIter<'_>> {
    let status = cfg.read_u16(addr, regs::STATUS);
    if status & regs::STATUS_CAPABILITIES_LIST == 0 {
        return None;
    }

    let cap_ptr = cfg.read_u8(addr, regs::CAPABILITIES_PTR);
    Some(CapabilityIter {
        cfg,
        addr,
        next_offset: cap_ptr,
    })
}

// ---------------------------------------------------------------------------
// VirtIO PCI capability
// ---------------------------------------------------------------------------

/// VirtIO PCI capability config type values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VirtioPciCfgType {
    /// Common configuration.
    CommonCfg = 1,
    /// Notifications.
    NotifyCfg = 2,
    /// ISR status.
    IsrCfg = 3,
    /// Device-specific configuration.
    DeviceCfg = 4,
    /// PCI configuration access.
    PciCfg = 5,
}

impl VirtioPciCfgType {
    /// Converts a raw byte to a config type, if valid.
    #[must_use]
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::CommonCfg),
            2 => Some(Self::NotifyCfg),
            3 => Some(Self::IsrCfg),
            4 => Some(Self::DeviceCfg),
            5 => Some(Self::PciCfg),
            _ => None,
        }
    }
}

/// Parsed VirtIO PCI capability structure.
#[derive(Debug, Clone, Copy)]
pub struct VirtioPciCap {
    /// Configuration structure type.
    pub cfg_type: VirtioPciCfgType,
    /// BAR index (0-5) containing this config structure.
    pub bar: u8,
    /// Offset within the BAR.
    pub offset: u32,
    /// Length of the config structure.
    pub length: u32,
    /// Raw config-space offset of this capability (for notify_off_multiplier).
    pub cap_offset: u8,
}

/// Reads a VirtIO PCI capability at the given config-space offset.
///
/// Returns `None` if the capability type is not recognized.
pub fn read_virtio_pci_cap(
    cfg: &dyn PciConfigAccess,
    addr: PciAddress,
    cap_offset: u8,
) -> Option<VirtioPciCap> {
    let cfg_type = VirtioPciCfgType::from_u8(cfg.read_u8(addr, cap_offset + 3))?;
    let bar = cfg.read_u8(addr, cap_offset + 4);
    let offset = cfg.read_u32(addr, cap_offset + 8);
    let length = cfg.read_u32(addr, cap_offset + 12);

    Some(VirtioPciCap {
        cfg_type,
        bar,
        offset,
        length,
        cap_offset,
    })
}
