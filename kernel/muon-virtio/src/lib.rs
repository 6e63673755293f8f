//! VirtIO device stack for Muon OS.
//!
//! Implements the VirtIO 1.x split-virtqueue protocol over two
//! interchangeable transports (memory-mapped registers and PCI
//! capability-located register windows) and drives three device
//! personalities: the entropy source, the block device, and the network
//! device.
//!
//! The stack is built for a single-CPU cooperative kernel. There are exactly
//! two execution contexts:
//!
//! - the **base context**, which submits work, runs the poll pump
//!   ([`Platform::tick`]), and walks used rings;
//! - the **interrupt context**, which only acknowledges the device
//!   ([`Platform::irq_entry`]) and pushes a device tag onto the lock-free
//!   [`IrqRing`].
//!
//! Completions flow back to the kernel through the
//! [`WorkSink`](muon_driver_api::WorkSink) trait; all errors are values.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod devices;
pub mod pci;
pub mod platform;
pub mod queue;
pub mod ring;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use platform::{MmioProbeSlot, PciScanConfig, Platform};
pub use queue::{Virtqueue, QUEUE_SIZE};
pub use ring::{IrqRing, IRQ_RING_CAPACITY};
pub use transport::{Transport, VirtioTransport};
