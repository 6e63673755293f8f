//! Device drivers and the shared bring-up sequence.
//!
//! Every device, regardless of transport, is brought up with the same
//! VirtIO 1.x dance: reset → ACKNOWLEDGE → DRIVER → read device config →
//! negotiate features → FEATURES_OK (verified by readback) → queue setup →
//! DRIVER_OK (verified against FAILED). The helpers here implement the
//! transport-independent steps; each driver interleaves its config reads
//! and queue setup between them.
//!
//! This driver family negotiates the empty feature set beyond baselines:
//! modern transports accept `VIRTIO_F_VERSION_1` and nothing else, legacy
//! transports accept nothing.

pub mod blk;
pub mod net;
pub mod rng;

pub use blk::BlkDevice;
pub use net::NetDevice;
pub use rng::RngDevice;

use alloc::boxed::Box;

use muon_driver_api::{DeviceKind, DmaAllocator, DriverError, WorkItem, WorkSink};

use crate::queue::{self, Virtqueue, QUEUE_SIZE};
use crate::transport::{DeviceStatus, Transport, VirtioTransport, VIRTIO_F_VERSION_1};

/// VirtIO device type: network card.
pub const VIRTIO_ID_NET: u32 = 1;
/// VirtIO device type: block device.
pub const VIRTIO_ID_BLOCK: u32 = 2;
/// VirtIO device type: entropy source.
pub const VIRTIO_ID_ENTROPY: u32 = 4;

/// Maps a VirtIO device type to the kind this stack can drive.
#[must_use]
pub fn kind_for_device_type(device_type: u32) -> Option<DeviceKind> {
    match device_type {
        VIRTIO_ID_NET => Some(DeviceKind::Net),
        VIRTIO_ID_BLOCK => Some(DeviceKind::Block),
        VIRTIO_ID_ENTROPY => Some(DeviceKind::Entropy),
        _ => None,
    }
}

/// The uniform surface every device driver exposes to the multiplexer.
pub trait VirtioDevice {
    /// Acknowledges the device's interrupt line. The only device operation
    /// legal from interrupt context.
    fn ack_isr(&self);

    /// Reaps the device's used ring(s), completing finished work through
    /// the sink. Runs in the base context only.
    fn process_irq(&mut self, sink: &mut dyn WorkSink);

    /// Queues one work item. Validation failures and queue exhaustion
    /// complete the work immediately through the sink.
    fn submit(&mut self, sink: &mut dyn WorkSink, work: Box<WorkItem>);

    /// Rings the doorbell for queues touched since the last flush. Called
    /// once per submission batch.
    fn flush_notify(&mut self);
}

/// Bring-up steps 1-3: reset, ACKNOWLEDGE, DRIVER.
pub(crate) fn begin_init(transport: &Transport) {
    transport.reset();
    transport.set_status(DeviceStatus::ACKNOWLEDGE);
    transport.set_status(DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER);
}

/// Bring-up steps 5-7: negotiate features and latch FEATURES_OK.
///
/// Reads both feature halves, accepts only `VIRTIO_F_VERSION_1` (modern
/// transports must offer it), then verifies the device kept FEATURES_OK.
pub(crate) fn negotiate_features(transport: &Transport) -> Result<(), DriverError> {
    let _lo = transport.features(0);
    let hi = transport.features(1);

    if !transport.is_legacy() && hi & VIRTIO_F_VERSION_1 == 0 {
        log::warn!("virtio: device does not offer VIRTIO_F_VERSION_1");
        transport.set_status(DeviceStatus::FAILED);
        return Err(DriverError::Unsupported);
    }

    transport.set_features(0, 0);
    let accepted_hi = if transport.is_legacy() {
        0
    } else {
        VIRTIO_F_VERSION_1
    };
    transport.set_features(1, accepted_hi);

    transport.set_status(
        DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER | DeviceStatus::FEATURES_OK,
    );
    if !transport.status().contains(DeviceStatus::FEATURES_OK) {
        log::warn!("virtio: device rejected features");
        transport.set_status(DeviceStatus::FAILED);
        return Err(DriverError::InitFailed);
    }
    Ok(())
}

/// Bring-up steps 9-10: set DRIVER_OK and verify the device did not fail.
pub(crate) fn driver_ok(transport: &Transport) -> Result<(), DriverError> {
    let status = transport.status();
    transport.set_status(status | DeviceStatus::DRIVER_OK);
    if transport.status().contains(DeviceStatus::FAILED) {
        return Err(DriverError::InitFailed);
    }
    Ok(())
}

/// Allocates, initializes, and programs one virtqueue.
///
/// The negotiated size is the device maximum capped at the build-time
/// limit [`QUEUE_SIZE`].
pub(crate) fn create_queue(
    transport: &mut Transport,
    dma: &dyn DmaAllocator,
    index: u16,
) -> Result<Virtqueue, DriverError> {
    let max = transport.max_queue_size(index);
    if max == 0 {
        return Err(DriverError::InitFailed);
    }
    let size = max.min(QUEUE_SIZE as u16);

    let base = dma.alloc_frames(queue::frames_for(size))?;
    // SAFETY: freshly allocated, frame-aligned DMA memory sized for `size`.
    let vq = unsafe { Virtqueue::new(base, size) };
    transport.setup_queue(index, &vq)?;
    Ok(vq)
}
