//! VirtIO transports.
//!
//! A transport is the register-level mechanism by which the driver talks to
//! a device. Two are supported — memory-mapped register windows
//! ([`MmioTransport`]) and PCI capability-located windows ([`PciTransport`])
//! — behind the single [`VirtioTransport`] contract. Device code holds the
//! [`Transport`] sum type and never touches registers directly.

pub mod mmio;
pub mod pci;

pub use mmio::MmioTransport;
pub use pci::PciTransport;

use muon_driver_api::DriverError;

use crate::queue::Virtqueue;

/// Maximum queues a single device uses (network: receive + transmit).
pub const MAX_QUEUES: usize = 2;

bitflags::bitflags! {
    /// Device status register bits (VirtIO 1.x §2.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        /// Guest OS has found the device.
        const ACKNOWLEDGE = 1;
        /// Guest OS knows how to drive the device.
        const DRIVER = 2;
        /// Driver is ready.
        const DRIVER_OK = 4;
        /// Feature negotiation complete.
        const FEATURES_OK = 8;
        /// Device has experienced an unrecoverable error.
        const DEVICE_NEEDS_RESET = 64;
        /// Something went wrong.
        const FAILED = 128;
    }
}

/// `VIRTIO_F_VERSION_1` (feature bit 32) as seen in the high feature dword.
pub const VIRTIO_F_VERSION_1: u32 = 1 << 0;

/// MSI-X "no vector" sentinel value.
pub const VIRTIO_MSI_NO_VECTOR: u16 = 0xFFFF;

/// The uniform register-level contract both transports implement.
///
/// All register accesses behind these operations are volatile and fenced;
/// callers need no additional barriers around them.
pub trait VirtioTransport {
    /// VirtIO device type (1 = net, 2 = block, 4 = entropy); 0 = empty slot.
    fn device_id(&self) -> u32;

    /// Whether this is a legacy (pre-1.0) transport revision.
    fn is_legacy(&self) -> bool;

    /// Writes 0 to the status register, resetting the device.
    fn reset(&self);

    /// Reads the device status register.
    fn status(&self) -> DeviceStatus;

    /// Writes the device status register.
    fn set_status(&self, status: DeviceStatus);

    /// Reads one half of the device feature vector (`select` 0 = bits 0-31,
    /// 1 = bits 32-63).
    fn features(&self, select: u32) -> u32;

    /// Writes one half of the driver feature vector.
    fn set_features(&self, select: u32, value: u32);

    /// Maximum size the device supports for queue `queue` (0 = queue absent).
    fn max_queue_size(&self, queue: u16) -> u16;

    /// Programs queue `queue` with the virtqueue's size and ring addresses
    /// and enables it.
    fn setup_queue(&mut self, queue: u16, vq: &Virtqueue) -> Result<(), DriverError>;

    /// Rings the doorbell for queue `queue`.
    fn notify(&self, queue: u16);

    /// Reads the interrupt status register.
    fn read_isr(&self) -> u32;

    /// Acknowledges interrupt status previously read with
    /// [`read_isr`](Self::read_isr).
    fn ack_isr(&self, value: u32);

    /// Reads an 8-bit value from device-specific configuration space.
    ///
    /// Returns `None` if the device exposes no configuration space.
    fn config_read_u8(&self, offset: u32) -> Option<u8>;

    /// Reads a 16-bit value from device-specific configuration space.
    fn config_read_u16(&self, offset: u32) -> Option<u16>;

    /// Reads a 32-bit value from device-specific configuration space.
    fn config_read_u32(&self, offset: u32) -> Option<u32>;

    /// Reads a 64-bit value from device-specific configuration space as two
    /// 32-bit reads.
    fn config_read_u64(&self, offset: u32) -> Option<u64> {
        let lo = u64::from(self.config_read_u32(offset)?);
        let hi = u64::from(self.config_read_u32(offset + 4)?);
        Some(lo | (hi << 32))
    }
}

/// A device's bound transport.
pub enum Transport {
    /// Memory-mapped register window.
    Mmio(MmioTransport),
    /// PCI capability-located register windows.
    Pci(PciTransport),
}

impl VirtioTransport for Transport {
    fn device_id(&self) -> u32 {
        match self {
            Self::Mmio(t) => t.device_id(),
            Self::Pci(t) => t.device_id(),
        }
    }

    fn is_legacy(&self) -> bool {
        match self {
            Self::Mmio(t) => t.is_legacy(),
            Self::Pci(t) => t.is_legacy(),
        }
    }

    fn reset(&self) {
        match self {
            Self::Mmio(t) => t.reset(),
            Self::Pci(t) => t.reset(),
        }
    }

    fn status(&self) -> DeviceStatus {
        match self {
            Self::Mmio(t) => t.status(),
            Self::Pci(t) => t.status(),
        }
    }

    fn set_status(&self, status: DeviceStatus) {
        match self {
            Self::Mmio(t) => t.set_status(status),
            Self::Pci(t) => t.set_status(status),
        }
    }

    fn features(&self, select: u32) -> u32 {
        match self {
            Self::Mmio(t) => t.features(select),
            Self::Pci(t) => t.features(select),
        }
    }

    fn set_features(&self, select: u32, value: u32) {
        match self {
            Self::Mmio(t) => t.set_features(select, value),
            Self::Pci(t) => t.set_features(select, value),
        }
    }

    fn max_queue_size(&self, queue: u16) -> u16 {
        match self {
            Self::Mmio(t) => t.max_queue_size(queue),
            Self::Pci(t) => t.max_queue_size(queue),
        }
    }

    fn setup_queue(&mut self, queue: u16, vq: &Virtqueue) -> Result<(), DriverError> {
        match self {
            Self::Mmio(t) => t.setup_queue(queue, vq),
            Self::Pci(t) => t.setup_queue(queue, vq),
        }
    }

    fn notify(&self, queue: u16) {
        match self {
            Self::Mmio(t) => t.notify(queue),
            Self::Pci(t) => t.notify(queue),
        }
    }

    fn read_isr(&self) -> u32 {
        match self {
            Self::Mmio(t) => t.read_isr(),
            Self::Pci(t) => t.read_isr(),
        }
    }

    fn ack_isr(&self, value: u32) {
        match self {
            Self::Mmio(t) => t.ack_isr(value),
            Self::Pci(t) => t.ack_isr(value),
        }
    }

    fn config_read_u8(&self, offset: u32) -> Option<u8> {
        match self {
            Self::Mmio(t) => t.config_read_u8(offset),
            Self::Pci(t) => t.config_read_u8(offset),
        }
    }

    fn config_read_u16(&self, offset: u32) -> Option<u16> {
        match self {
            Self::Mmio(t) => t.config_read_u16(offset),
            Self::Pci(t) => t.config_read_u16(offset),
        }
    }

    fn config_read_u32(&self, offset: u32) -> Option<u32> {
        match self {
            Self::Mmio(t) => t.config_read_u32(offset),
            Self::Pci(t) => t.config_read_u32(offset),
        }
    }
}
