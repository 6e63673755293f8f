//! VirtIO memory-mapped transport.
//!
//! A virtio-mmio device is a register window beginning with the magic value
//! `"virt"` and a version register (1 = legacy, 2 = modern). Hypervisors
//! place these windows at fixed strides; see
//! [`platform`](crate::platform) for the probe tables.
//!
//! Queue programming differs by version: legacy devices derive all three
//! ring regions from a single page frame number (which the contiguous queue
//! memory block of [`crate::queue`] is laid out for), modern devices take
//! the three region addresses separately and latch them with
//! `QUEUE_READY`.

use core::ptr;
use core::sync::atomic::{fence, Ordering};

use muon_driver_api::DriverError;

use super::{DeviceStatus, VirtioTransport};
use crate::queue::Virtqueue;

/// Expected value of the magic register ("virt", little-endian).
pub const MMIO_MAGIC: u32 = 0x7472_6976;

/// MMIO register offsets (VirtIO 1.x §4.2.2; legacy registers per §4.2.4).
mod regs {
    pub const MAGIC: usize = 0x000;
    pub const VERSION: usize = 0x004;
    pub const DEVICE_ID: usize = 0x008;
    pub const DEVICE_FEATURES: usize = 0x010;
    pub const DEVICE_FEATURES_SEL: usize = 0x014;
    pub const DRIVER_FEATURES: usize = 0x020;
    pub const DRIVER_FEATURES_SEL: usize = 0x024;
    /// Legacy only: guest page size for PFN-based queue addressing.
    pub const GUEST_PAGE_SIZE: usize = 0x028;
    pub const QUEUE_SEL: usize = 0x030;
    pub const QUEUE_NUM_MAX: usize = 0x034;
    pub const QUEUE_NUM: usize = 0x038;
    /// Legacy only: alignment of the used ring within the queue block.
    pub const QUEUE_ALIGN: usize = 0x03C;
    /// Legacy only: queue block page frame number.
    pub const QUEUE_PFN: usize = 0x040;
    pub const QUEUE_READY: usize = 0x044;
    pub const QUEUE_NOTIFY: usize = 0x050;
    pub const INTERRUPT_STATUS: usize = 0x060;
    pub const INTERRUPT_ACK: usize = 0x064;
    pub const STATUS: usize = 0x070;
    pub const QUEUE_DESC_LOW: usize = 0x080;
    pub const QUEUE_DESC_HIGH: usize = 0x084;
    pub const QUEUE_DRIVER_LOW: usize = 0x090;
    pub const QUEUE_DRIVER_HIGH: usize = 0x094;
    pub const QUEUE_DEVICE_LOW: usize = 0x0A0;
    pub const QUEUE_DEVICE_HIGH: usize = 0x0A4;
    /// Device-specific configuration space.
    pub const CONFIG: usize = 0x100;
}

/// Guest page size programmed into legacy devices.
const GUEST_PAGE: u32 = 4096;

/// Driver for one virtio-mmio register window.
pub struct MmioTransport {
    /// Identity-mapped base of the register window.
    base: u64,
    /// Transport revision (1 = legacy, 2 = modern).
    version: u32,
}

impl MmioTransport {
    /// Validates the window at `base` and captures its version.
    ///
    /// Fails with [`DriverError::DeviceNotFound`] on a magic mismatch and
    /// [`DriverError::Unsupported`] on an unknown version.
    ///
    /// # Safety
    ///
    /// `base` must be the identity-mapped address of a virtio-mmio register
    /// window that stays mapped for the transport's lifetime.
    pub unsafe fn new(base: u64) -> Result<Self, DriverError> {
        let t = Self { base, version: 0 };
        if t.read32(regs::MAGIC) != MMIO_MAGIC {
            return Err(DriverError::DeviceNotFound);
        }
        let version = t.read32(regs::VERSION);
        if version != 1 && version != 2 {
            return Err(DriverError::Unsupported);
        }
        Ok(Self { base, version })
    }

    /// Transport revision (1 or 2).
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        // Registers may change under us; fence so the read is fresh.
        fence(Ordering::SeqCst);
        // SAFETY: offset is a register within the mapped window.
        unsafe { ptr::read_volatile((self.base as usize + offset) as *const u32) }
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: offset is a register within the mapped window.
        unsafe { ptr::write_volatile((self.base as usize + offset) as *mut u32, value) };
        fence(Ordering::SeqCst);
    }
}

impl VirtioTransport for MmioTransport {
    fn device_id(&self) -> u32 {
        self.read32(regs::DEVICE_ID)
    }

    fn is_legacy(&self) -> bool {
        self.version == 1
    }

    fn reset(&self) {
        self.write32(regs::STATUS, 0);
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_truncate(self.read32(regs::STATUS) as u8)
    }

    fn set_status(&self, status: DeviceStatus) {
        self.write32(regs::STATUS, u32::from(status.bits()));
    }

    fn features(&self, select: u32) -> u32 {
        self.write32(regs::DEVICE_FEATURES_SEL, select);
        self.read32(regs::DEVICE_FEATURES)
    }

    fn set_features(&self, select: u32, value: u32) {
        self.write32(regs::DRIVER_FEATURES_SEL, select);
        self.write32(regs::DRIVER_FEATURES, value);
    }

    fn max_queue_size(&self, queue: u16) -> u16 {
        self.write32(regs::QUEUE_SEL, u32::from(queue));
        self.read32(regs::QUEUE_NUM_MAX) as u16
    }

    fn setup_queue(&mut self, queue: u16, vq: &Virtqueue) -> Result<(), DriverError> {
        self.write32(regs::QUEUE_SEL, u32::from(queue));

        if self.version == 1 {
            // Legacy: the device derives avail/used from one PFN, assuming
            // a 4 KiB-aligned used ring — the queue block guarantees that.
            self.write32(regs::GUEST_PAGE_SIZE, GUEST_PAGE);
            self.write32(regs::QUEUE_NUM, u32::from(vq.size()));
            self.write32(regs::QUEUE_ALIGN, GUEST_PAGE);
            self.write32(regs::QUEUE_PFN, (vq.desc_phys() >> 12) as u32);
            return Ok(());
        }

        if self.read32(regs::QUEUE_READY) != 0 {
            return Err(DriverError::InvalidState);
        }
        self.write32(regs::QUEUE_NUM, u32::from(vq.size()));
        self.write32(regs::QUEUE_DESC_LOW, vq.desc_phys() as u32);
        self.write32(regs::QUEUE_DESC_HIGH, (vq.desc_phys() >> 32) as u32);
        self.write32(regs::QUEUE_DRIVER_LOW, vq.avail_phys() as u32);
        self.write32(regs::QUEUE_DRIVER_HIGH, (vq.avail_phys() >> 32) as u32);
        self.write32(regs::QUEUE_DEVICE_LOW, vq.used_phys() as u32);
        self.write32(regs::QUEUE_DEVICE_HIGH, (vq.used_phys() >> 32) as u32);
        self.write32(regs::QUEUE_READY, 1);
        Ok(())
    }

    fn notify(&self, queue: u16) {
        self.write32(regs::QUEUE_NOTIFY, u32::from(queue));
    }

    fn read_isr(&self) -> u32 {
        self.read32(regs::INTERRUPT_STATUS)
    }

    fn ack_isr(&self, value: u32) {
        self.write32(regs::INTERRUPT_ACK, value);
    }

    fn config_read_u8(&self, offset: u32) -> Option<u8> {
        fence(Ordering::SeqCst);
        let p = (self.base as usize + regs::CONFIG + offset as usize) as *const u8;
        // SAFETY: config space is within the mapped window.
        Some(unsafe { ptr::read_volatile(p) })
    }

    fn config_read_u16(&self, offset: u32) -> Option<u16> {
        fence(Ordering::SeqCst);
        let p = (self.base as usize + regs::CONFIG + offset as usize) as *const u16;
        // SAFETY: config space is within the mapped window.
        Some(unsafe { ptr::read_volatile(p) })
    }

    fn config_read_u32(&self, offset: u32) -> Option<u32> {
        fence(Ordering::SeqCst);
        let p = (self.base as usize + regs::CONFIG + offset as usize) as *const u32;
        // SAFETY: config space is within the mapped window.
        Some(unsafe { ptr::read_volatile(p) })
    }
}
