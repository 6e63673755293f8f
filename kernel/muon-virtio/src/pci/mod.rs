//! PCI configuration-space helpers.
//!
//! Discovery-time plumbing for the PCI transport: standard register
//! offsets, the capability linked-list walker, and bare-metal BAR
//! assignment. All config-space traffic goes through the platform's
//! [`PciConfigAccess`](muon_driver_api::PciConfigAccess) implementation.

pub mod bars;
pub mod caps;
pub mod config;

pub use bars::BarAllocator;
pub use caps::{walk_capabilities, RawCapability, VirtioPciCap, VirtioPciCfgType};
