//! Platform service contracts consumed by the device stack.
//!
//! The stack assumes an identity-mapped, cache-coherent platform: a physical
//! address returned by [`DmaAllocator::alloc_frames`] is directly usable as
//! a pointer in kernel code and as a bus address in device descriptors.

use crate::error::DriverError;
use crate::work::DeviceKind;

/// Size of one DMA frame in bytes.
pub const FRAME_SIZE: usize = 4096;

/// Contiguous DMA memory allocation.
pub trait DmaAllocator {
    /// Allocates `count` contiguous, zeroable frames for DMA use.
    ///
    /// Returns the physical base address of the first frame, aligned to
    /// [`FRAME_SIZE`].
    fn alloc_frames(&self, count: usize) -> Result<u64, DriverError>;

    /// Frees frames previously allocated with
    /// [`alloc_frames`](Self::alloc_frames).
    ///
    /// # Safety
    ///
    /// The caller must ensure that no device DMA references these frames and
    /// that `phys_base` and `count` match a previous allocation.
    unsafe fn free_frames(&self, phys_base: u64, count: usize);
}

/// Interrupt routing, provided by the platform.
///
/// The stack registers one vector per discovered device; the platform's
/// handler for that vector is expected to invoke the stack's IRQ entry with
/// the registered [`DeviceKind`] and then signal EOI.
pub trait IrqControl {
    /// Associates `vector` with a device kind.
    fn register_irq(&mut self, vector: u32, kind: DeviceKind) -> Result<(), DriverError>;

    /// Unmasks `vector` in the interrupt controller.
    fn enable_irq(&mut self, vector: u32) -> Result<(), DriverError>;
}
