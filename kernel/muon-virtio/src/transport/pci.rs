//! VirtIO PCI modern transport.
//!
//! A VirtIO PCI device describes its register windows through
//! vendor-specific capabilities in configuration space; each capability
//! names a BAR and an offset. Four windows matter here: the common
//! configuration structure, the notify region (plus its per-queue offset
//! multiplier), the single-byte ISR status register, and the optional
//! device-specific configuration (the entropy device has none).
//!
//! MSI-X is plumbed but not used by default: bring-up forces `msix_config`
//! and every `queue_msix_vector` to the "no vector" sentinel so completions
//! arrive over legacy INTx.

use core::ptr;
use core::sync::atomic::{fence, Ordering};

use muon_driver_api::{DriverError, PciBar, PciConfigAccess, PciDeviceInfo};

use super::{DeviceStatus, VirtioTransport, MAX_QUEUES, VIRTIO_MSI_NO_VECTOR};
use crate::pci::caps::{self, VirtioPciCap, VirtioPciCfgType};
use crate::pci::config::regs;
use crate::queue::Virtqueue;

// -- Common configuration structure offsets (VirtIO 1.0 §4.1.4.3) -------------

const COMMON_DEVICE_FEATURE_SELECT: u32 = 0x00;
const COMMON_DEVICE_FEATURE: u32 = 0x04;
const COMMON_DRIVER_FEATURE_SELECT: u32 = 0x08;
const COMMON_DRIVER_FEATURE: u32 = 0x0C;
const COMMON_MSIX_CONFIG: u32 = 0x10;
const COMMON_DEVICE_STATUS: u32 = 0x14;
const COMMON_QUEUE_SELECT: u32 = 0x16;
const COMMON_QUEUE_SIZE: u32 = 0x18;
const COMMON_QUEUE_MSIX_VECTOR: u32 = 0x1A;
const COMMON_QUEUE_ENABLE: u32 = 0x1C;
const COMMON_QUEUE_NOTIFY_OFF: u32 = 0x1E;
const COMMON_QUEUE_DESC: u32 = 0x20;
const COMMON_QUEUE_DRIVER: u32 = 0x28;
const COMMON_QUEUE_DEVICE: u32 = 0x30;

/// Driver for one VirtIO device behind the PCI modern transport.
pub struct PciTransport {
    /// Identity-mapped address of the common configuration structure.
    common: u64,
    /// Identity-mapped base of the notify region.
    notify: u64,
    /// Multiplier applied to each queue's notify offset.
    notify_off_multiplier: u32,
    /// Identity-mapped address of the ISR status byte.
    isr: u64,
    /// Identity-mapped address of device-specific configuration, if any.
    device_cfg: Option<u64>,
    /// Per-queue notify offsets captured during queue setup.
    notify_off: [u16; MAX_QUEUES],
    /// VirtIO device type derived from the PCI device ID.
    virtio_id: u32,
}

/// Maps a VirtIO PCI device ID to the VirtIO device type.
///
/// Modern IDs are `0x1040 + type`; transitional devices use fixed legacy
/// IDs. Returns 0 for IDs outside the VirtIO range.
#[must_use]
pub fn virtio_device_type(pci_device_id: u16) -> u32 {
    match pci_device_id {
        0x1000 => 1, // transitional network
        0x1001 => 2, // transitional block
        0x1005 => 4, // transitional entropy
        0x1040..=0x107F => u32::from(pci_device_id - 0x1040),
        _ => 0,
    }
}

impl PciTransport {
    /// Locates the VirtIO config windows via PCI capabilities.
    ///
    /// `info.bars` must already carry assigned addresses (see
    /// [`BarAllocator`](crate::pci::BarAllocator)). Fails unless the
    /// common, notify, and ISR capabilities are all present and point into
    /// memory BARs. Forces `msix_config` to "no vector".
    ///
    /// # Safety
    ///
    /// The assigned memory BARs of `info` must be backed by identity-mapped
    /// memory that stays valid for the transport's lifetime.
    pub unsafe fn new(
        cfg: &dyn PciConfigAccess,
        info: &PciDeviceInfo,
    ) -> Result<Self, DriverError> {
        let cap_iter =
            caps::walk_capabilities(cfg, info.address).ok_or(DriverError::InitFailed)?;

        let mut common_cap: Option<VirtioPciCap> = None;
        let mut notify_cap: Option<VirtioPciCap> = None;
        let mut isr_cap: Option<VirtioPciCap> = None;
        let mut device_cap: Option<VirtioPciCap> = None;

        for raw in cap_iter {
            if raw.id != regs::CAP_ID_VENDOR {
                continue;
            }
            if let Some(vcap) = caps::read_virtio_pci_cap(cfg, info.address, raw.offset) {
                match vcap.cfg_type {
                    VirtioPciCfgType::CommonCfg => common_cap = Some(vcap),
                    VirtioPciCfgType::NotifyCfg => notify_cap = Some(vcap),
                    VirtioPciCfgType::IsrCfg => isr_cap = Some(vcap),
                    VirtioPciCfgType::DeviceCfg => device_cap = Some(vcap),
                    VirtioPciCfgType::PciCfg => {} // not used by this transport
                }
            }
        }

        let common_cap = common_cap.ok_or(DriverError::InitFailed)?;
        let notify_cap = notify_cap.ok_or(DriverError::InitFailed)?;
        let isr_cap = isr_cap.ok_or(DriverError::InitFailed)?;

        // notify_off_multiplier lives right after the notify capability.
        let notify_off_multiplier = cfg.read_u32(info.address, notify_cap.cap_offset + 16);

        let window = |cap: &VirtioPciCap| -> Result<u64, DriverError> {
            match info.bars[cap.bar as usize] {
                PciBar::Memory { base, .. } => Ok(base + u64::from(cap.offset)),
                _ => Err(DriverError::InitFailed),
            }
        };

        let transport = Self {
            common: window(&common_cap)?,
            notify: window(&notify_cap)?,
            notify_off_multiplier,
            isr: window(&isr_cap)?,
            device_cfg: match device_cap {
                Some(ref cap) => Some(window(cap)?),
                None => None,
            },
            notify_off: [0; MAX_QUEUES],
            virtio_id: virtio_device_type(info.device_id),
        };

        // Legacy INTx delivery: no MSI-X vector for config changes.
        transport.common_write_u16(COMMON_MSIX_CONFIG, VIRTIO_MSI_NO_VECTOR);

        Ok(transport)
    }

    // -- Common config accessors ----------------------------------------------

    fn common_read_u8(&self, offset: u32) -> u8 {
        fence(Ordering::SeqCst);
        // SAFETY: offset is a common-config field within the mapped window.
        unsafe { ptr::read_volatile((self.common + u64::from(offset)) as usize as *const u8) }
    }

    fn common_write_u8(&self, offset: u32, value: u8) {
        // SAFETY: offset is a common-config field within the mapped window.
        unsafe {
            ptr::write_volatile((self.common + u64::from(offset)) as usize as *mut u8, value);
        }
        fence(Ordering::SeqCst);
    }

    fn common_read_u16(&self, offset: u32) -> u16 {
        fence(Ordering::SeqCst);
        // SAFETY: offset is a common-config field within the mapped window.
        unsafe { ptr::read_volatile((self.common + u64::from(offset)) as usize as *const u16) }
    }

    fn common_write_u16(&self, offset: u32, value: u16) {
        // SAFETY: offset is a common-config field within the mapped window.
        unsafe {
            ptr::write_volatile((self.common + u64::from(offset)) as usize as *mut u16, value);
        }
        fence(Ordering::SeqCst);
    }

    fn common_read_u32(&self, offset: u32) -> u32 {
        fence(Ordering::SeqCst);
        // SAFETY: offset is a common-config field within the mapped window.
        unsafe { ptr::read_volatile((self.common + u64::from(offset)) as usize as *const u32) }
    }

    fn common_write_u32(&self, offset: u32, value: u32) {
        // SAFETY: offset is a common-config field within the mapped window.
        unsafe {
            ptr::write_volatile((self.common + u64::from(offset)) as usize as *mut u32, value);
        }
        fence(Ordering::SeqCst);
    }

    fn common_write_u64(&self, offset: u32, value: u64) {
        self.common_write_u32(offset, value as u32);
        self.common_write_u32(offset + 4, (value >> 32) as u32);
    }

    /// Programs the MSI-X vector for the currently selected queue.
    ///
    /// Unused by default bring-up (which forces "no vector") but kept for
    /// platforms that route per-queue vectors.
    pub fn set_queue_msix_vector(&self, vector: u16) {
        self.common_write_u16(COMMON_QUEUE_MSIX_VECTOR, vector);
    }

    /// Reads back the MSI-X vector of the currently selected queue.
    #[must_use]
    pub fn queue_msix_vector(&self) -> u16 {
        self.common_read_u16(COMMON_QUEUE_MSIX_VECTOR)
    }
}

impl VirtioTransport for PciTransport {
    fn device_id(&self) -> u32 {
        self.virtio_id
    }

    fn is_legacy(&self) -> bool {
        false
    }

    fn reset(&self) {
        self.common_write_u8(COMMON_DEVICE_STATUS, 0);
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_truncate(self.common_read_u8(COMMON_DEVICE_STATUS))
    }

    fn set_status(&self, status: DeviceStatus) {
        self.common_write_u8(COMMON_DEVICE_STATUS, status.bits());
    }

    fn features(&self, select: u32) -> u32 {
        self.common_write_u32(COMMON_DEVICE_FEATURE_SELECT, select);
        self.common_read_u32(COMMON_DEVICE_FEATURE)
    }

    fn set_features(&self, select: u32, value: u32) {
        self.common_write_u32(COMMON_DRIVER_FEATURE_SELECT, select);
        self.common_write_u32(COMMON_DRIVER_FEATURE, value);
    }

    fn max_queue_size(&self, queue: u16) -> u16 {
        self.common_write_u16(COMMON_QUEUE_SELECT, queue);
        self.common_read_u16(COMMON_QUEUE_SIZE)
    }

    fn setup_queue(&mut self, queue: u16, vq: &Virtqueue) -> Result<(), DriverError> {
        if usize::from(queue) >= MAX_QUEUES {
            return Err(DriverError::InvalidState);
        }

        self.common_write_u16(COMMON_QUEUE_SELECT, queue);
        if self.common_read_u16(COMMON_QUEUE_ENABLE) != 0 {
            return Err(DriverError::InvalidState);
        }

        self.common_write_u16(COMMON_QUEUE_SIZE, vq.size());
        self.set_queue_msix_vector(VIRTIO_MSI_NO_VECTOR);
        self.common_write_u64(COMMON_QUEUE_DESC, vq.desc_phys());
        self.common_write_u64(COMMON_QUEUE_DRIVER, vq.avail_phys());
        self.common_write_u64(COMMON_QUEUE_DEVICE, vq.used_phys());

        self.notify_off[usize::from(queue)] = self.common_read_u16(COMMON_QUEUE_NOTIFY_OFF);
        self.common_write_u16(COMMON_QUEUE_ENABLE, 1);
        Ok(())
    }

    fn notify(&self, queue: u16) {
        let off = u64::from(self.notify_off[usize::from(queue) % MAX_QUEUES])
            * u64::from(self.notify_off_multiplier);
        // SAFETY: the doorbell lies within the mapped notify window.
        unsafe {
            ptr::write_volatile((self.notify + off) as usize as *mut u16, queue);
        }
        fence(Ordering::SeqCst);
    }

    fn read_isr(&self) -> u32 {
        fence(Ordering::SeqCst);
        // ISR status is clear-on-read.
        // SAFETY: the ISR byte lies within the mapped ISR window.
        u32::from(unsafe { ptr::read_volatile(self.isr as usize as *const u8) })
    }

    fn ack_isr(&self, _value: u32) {
        // Reading the ISR register already cleared it.
    }

    fn config_read_u8(&self, offset: u32) -> Option<u8> {
        let base = self.device_cfg?;
        fence(Ordering::SeqCst);
        // SAFETY: offset is within the mapped device-config window.
        Some(unsafe { ptr::read_volatile((base + u64::from(offset)) as usize as *const u8) })
    }

    fn config_read_u16(&self, offset: u32) -> Option<u16> {
        let base = self.device_cfg?;
        fence(Ordering::SeqCst);
        // SAFETY: offset is within the mapped device-config window.
        Some(unsafe { ptr::read_volatile((base + u64::from(offset)) as usize as *const u16) })
    }

    fn config_read_u32(&self, offset: u32) -> Option<u32> {
        let base = self.device_cfg?;
        fence(Ordering::SeqCst);
        // SAFETY: offset is within the mapped device-config window.
        Some(unsafe { ptr::read_volatile((base + u64::from(offset)) as usize as *const u32) })
    }
}
