//! Automated flake search on a motorised microscope stage.
//!
//! A scan visits a serpentine grid of stage positions, captures a frame at
//! each one and flags frames whose bright area exceeds a dynamically
//! calibrated threshold. Results go to an append-only CSV ledger and PNG
//! artifacts inside a per-scan session directory, from which flakes can later
//! be reviewed and navigated back to.
//!
//! - [`hardware`]: stage/camera capability traits, exclusive rig ownership,
//!   simulated devices
//! - [`detection`]: smoothing, calibration, classification, renderings
//! - [`scan`]: grid plan, ledger, events, homing, the scan state machine
//! - [`session`]: session directories, metadata and image sinks
//! - [`review`]: flake listing and navigate-to-flake

pub mod config;
pub mod detection;
pub mod error;
pub mod hardware;
pub mod review;
pub mod scan;
pub mod session;

pub use config::ScanConfig;
pub use error::{DeviceError, ScanError, ScanResult, StorageError};
pub use scan::{ScanEvent, ScanHandle, ScanOrchestrator, ScanState};
