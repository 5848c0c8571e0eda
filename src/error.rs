//! Custom error types for the scanner.
//!
//! The taxonomy mirrors the three ways a scan can fail:
//!
//! - **`DeviceError`**: the stage or camera reported a fault, stopped answering,
//!   or did not finish a motion within its timeout. Always fatal to the
//!   operation in progress and never retried automatically.
//! - **`StorageError`**: the result ledger or an image artifact could not be
//!   written. Fatal, because later navigation addresses captures by index and a
//!   hole in the record set would silently shift every lookup.
//! - **`ScanError::Calibration`**: the threshold sampling pass failed, so there
//!   is no threshold to classify with and the scan never starts.
//!
//! `ScanError` consolidates these (plus configuration and cancellation) for the
//! orchestrator. By using `#[from]`, device and storage failures convert with the
//! `?` operator wherever a `ScanResult` is returned.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the scan error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Failure reported by a stage or camera capability.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Communication with {device} lost: {message}")]
    Communication { device: String, message: String },

    #[error("{device} reported a fault: {message}")]
    Fault { device: String, message: String },

    #[error("{operation} did not complete within {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Devices are leased by a running scan")]
    Busy,

    #[error("{0} handle already released")]
    Closed(String),
}

impl DeviceError {
    /// Shorthand for a device-side fault.
    pub fn fault(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fault {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a lost connection.
    pub fn communication(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Communication {
            device: device.into(),
            message: message.into(),
        }
    }
}

/// Failure writing or reading the durable scan artifacts.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Metadata serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record index out of order: expected {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },
}

/// Top-level error for homing, scanning and navigation.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Calibration failed: {0}")]
    Calibration(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid scan plan: {0}")]
    InvalidPlan(String),

    #[error("No capture with index {0} in this session")]
    UnknownCapture(u64),

    #[error("Scan cancelled")]
    Cancelled,

    #[error("Scan task terminated unexpectedly: {0}")]
    Join(String),
}

impl ScanError {
    /// True for failures that leave the rig in an unknown physical state.
    pub fn is_device_failure(&self) -> bool {
        matches!(self, ScanError::Device(_) | ScanError::Calibration(_))
    }
}
