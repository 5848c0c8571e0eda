//! Image analysis: smoothing, threshold calibration, classification and the
//! renderings saved for flakes.

pub mod blur;
pub mod calibration;
pub mod classifier;
pub mod render;

pub use calibration::{ThresholdCalibrator, ThresholdModel};
pub use classifier::{Classification, FrameClassifier};
pub use render::FlakeRenderings;
