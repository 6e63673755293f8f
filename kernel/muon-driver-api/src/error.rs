//! Driver error types.

use core::fmt;

/// Errors that can occur while bringing up or operating a device driver.
///
/// These describe *driver-level* failures (bad hardware state, exhausted
/// resources). Per-request outcomes use [`crate::work::WorkResult`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// The hardware device was not found or did not respond.
    DeviceNotFound,
    /// Driver initialization failed.
    InitFailed,
    /// The device speaks a protocol revision this driver does not support.
    Unsupported,
    /// An I/O error occurred during a hardware operation.
    IoError,
    /// The driver is not in a valid state for this operation.
    InvalidState,
    /// A memory allocation failed.
    NoMemory,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceNotFound => f.write_str("device not found"),
            Self::InitFailed => f.write_str("driver initialization failed"),
            Self::Unsupported => f.write_str("operation not supported"),
            Self::IoError => f.write_str("I/O error"),
            Self::InvalidState => f.write_str("invalid driver state"),
            Self::NoMemory => f.write_str("out of memory"),
        }
    }
}
