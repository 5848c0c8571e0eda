//! Capability traits for the stage and camera.
//!
//! The scan core never talks to a driver directly; it is written against
//! these two traits. Implementations handle the protocol-specific details
//! (Kinesis controllers, uc480 cameras, or the simulated rig in `mock`).
//!
//! All traits require `Send + Sync` so handles can be moved into the scan
//! task. Methods take `&self`; implementations serialise access internally.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DeviceError;

/// One of the two linear axes of the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    /// Both axes, X first.
    pub const BOTH: [Axis; 2] = [Axis::X, Axis::Y];
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Y => write!(f, "Y"),
        }
    }
}

/// Velocity profile applied to an axis before moving.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityProfile {
    pub acceleration: f64,
    pub max_velocity: f64,
}

/// Acquisition settings applied to the camera once per scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    pub exposure_ms: f64,
    pub gain: u32,
    pub pixel_rate_hz: f64,
}

/// Single 8-bit monochrome frame, row-major.
///
/// The buffer always holds exactly `width * height` pixels; the only way to
/// wrap foreign data is the checked [`Frame::from_pixels`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Frame {
    /// Wrap an existing buffer. Returns `None` if the length does not match.
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        if pixels.len() == width as usize * height as usize {
            Some(Self {
                width,
                height,
                pixels,
            })
        } else {
            None
        }
    }

    /// Frame filled with a single intensity.
    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            width,
            height,
            pixels: vec![value; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Mutable view of the buffer; its length cannot change.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    /// Same-sized frame with every pixel passed through `f`.
    pub fn map(&self, f: impl Fn(u8) -> u8) -> Self {
        Self {
            width: self.width,
            height: self.height,
            pixels: self.pixels.iter().map(|&v| f(v)).collect(),
        }
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: u8) {
        let idx = y as usize * self.width as usize + x as usize;
        self.pixels[idx] = value;
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

/// Two independent motorised linear axes addressed in native step units.
///
/// ## Motion model
/// - `move_to` starts a motion and may return before it finishes
/// - `wait_until_stopped` blocks until the axis is stationary
/// - `home` / `wait_until_homed` run the controller's reference search
///
/// Any error is a `DeviceError` and is fatal to the calling operation.
#[async_trait]
pub trait StageController: Send + Sync {
    /// Start an absolute move of `axis` to `step`.
    async fn move_to(&self, axis: Axis, step: i64) -> Result<(), DeviceError>;

    /// Block until `axis` has stopped moving.
    async fn wait_until_stopped(&self, axis: Axis) -> Result<(), DeviceError>;

    /// Start the homing sequence of `axis`.
    async fn home(&self, axis: Axis) -> Result<(), DeviceError>;

    /// Block until the homing sequence of `axis` has finished.
    async fn wait_until_homed(&self, axis: Axis) -> Result<(), DeviceError>;

    /// Configure acceleration and maximum velocity of `axis`.
    async fn set_velocity(&self, axis: Axis, profile: VelocityProfile) -> Result<(), DeviceError>;

    /// Current position of `axis` in steps.
    async fn current_position(&self, axis: Axis) -> Result<i64, DeviceError>;

    /// Release the controller connection. Further calls fail with `Closed`.
    async fn release(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Single-frame camera.
#[async_trait]
pub trait CameraController: Send + Sync {
    /// Apply exposure, gain and pixel clock.
    async fn configure(&self, settings: &CameraSettings) -> Result<(), DeviceError>;

    /// Snap one frame.
    async fn capture_frame(&self) -> Result<Frame, DeviceError>;

    /// Release the camera. Further calls fail with `Closed`.
    async fn release(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}
