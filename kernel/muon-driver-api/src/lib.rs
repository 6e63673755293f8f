//! Driver subsystem contract for the Muon kernel.
//!
//! This crate defines the surface shared between the kernel proper and the
//! device stack:
//!
//! - **Work items** ([`WorkItem`]) — kernel-produced request objects routed to
//!   a device, completed back through a [`WorkSink`].
//! - **Service traits** ([`DmaAllocator`], [`IrqControl`],
//!   [`PciConfigAccess`]) — platform facilities the device stack consumes
//!   without depending on kernel internals.
//! - **PCI bus types** ([`PciAddress`], [`PciBar`], [`PciDeviceInfo`]) used
//!   during discovery.
//!
//! Everything here is `no_std` + `alloc`; the crate is host-testable.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod pci;
pub mod services;
pub mod work;

// Re-export all public types at the crate root for ergonomic imports.
pub use error::DriverError;
pub use pci::{PciAddress, PciBar, PciConfigAccess, PciDeviceInfo};
pub use services::{DmaAllocator, IrqControl, FRAME_SIZE};
pub use work::{
    BlockIo, BlockSegment, DeviceKind, NetRecv, NetRxBuffer, NetSend, RngRead, WorkId, WorkItem,
    WorkKind, WorkResult, WorkSink, WorkState, NET_RECV_MAX_BUFFERS,
};
