//! Device layer: capability traits, exclusive ownership and simulated devices.

pub mod capabilities;
pub mod mock;
pub mod motion;
pub mod rig;

pub use capabilities::{
    Axis, CameraController, CameraSettings, Frame, StageController, VelocityProfile,
};
pub use mock::{simulated_rig, MockCamera, MockStage, SimulatedSample};
pub use rig::{Devices, Rig, RigLease};
