//! Configuration system using Figment.
//!
//! Configuration is layered (lowest to highest precedence):
//! 1. Built-in defaults matching the physical setup (Kinesis stages, uc480 camera)
//! 2. A TOML file (default: `config/flake_scan.toml`, optional)
//! 3. Environment variables prefixed with `FLAKESCAN_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! FLAKESCAN_APPLICATION__LOG_LEVEL=debug
//! FLAKESCAN_DETECTION__FLAKE_PIXEL_CUTOFF=150
//! FLAKESCAN_STORAGE__ROOT_DIR=/data/scans
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/flake_scan.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub application: ApplicationConfig,
    pub stage: StageConfig,
    pub grid: GridConfig,
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub storage: StorageConfig,
    pub review: ReviewConfig,
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "flake_scan".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Two-axis stage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Serial number of the X-axis controller
    pub x_serial: String,
    /// Serial number of the Y-axis controller
    pub y_serial: String,
    /// Acceleration in controller units
    pub acceleration: f64,
    /// Maximum velocity in controller units
    pub max_velocity: f64,
    /// Upper bound on a single move + wait
    pub motion_timeout_ms: u64,
    /// Upper bound on a homing sequence
    pub home_timeout_ms: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            x_serial: "27261810".to_string(),
            y_serial: "27261747".to_string(),
            acceleration: 50_000.0,
            max_velocity: 50_000.0,
            motion_timeout_ms: 30_000,
            home_timeout_ms: 120_000,
        }
    }
}

impl StageConfig {
    pub fn motion_timeout(&self) -> Duration {
        Duration::from_millis(self.motion_timeout_ms)
    }

    pub fn home_timeout(&self) -> Duration {
        Duration::from_millis(self.home_timeout_ms)
    }
}

/// Grid geometry. Travel range and offset are physical lengths; increments
/// are already in stage steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub travel_range_um: f64,
    pub steps_per_um: f64,
    pub x_increment: i64,
    pub y_increment: i64,
    /// First-row offset; the stage misbehaves on the first increment from y=0
    pub y_offset_um: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            travel_range_um: 12_000.0,
            steps_per_um: 300.0 / 8.6818,
            x_increment: 18_800,
            y_increment: 14_100,
            y_offset_um: 500.0,
        }
    }
}

impl GridConfig {
    /// Travel range in stage steps (truncated).
    pub fn travel_range_steps(&self) -> i64 {
        (self.travel_range_um * self.steps_per_um) as i64
    }

    /// Y offset in stage steps (rounded).
    pub fn y_offset_steps(&self) -> i64 {
        (self.y_offset_um * self.steps_per_um).round() as i64
    }
}

/// Camera acquisition settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub exposure_ms: f64,
    pub gain: u32,
    pub pixel_rate_hz: f64,
    /// Pause between the end of a move and the capture
    pub settle_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            exposure_ms: 200.0,
            gain: 4,
            pixel_rate_hz: 1e6,
            settle_ms: 100,
        }
    }
}

/// Detector tuning. The pixel cutoff and highlight band are empirical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Gaussian kernel edge length (odd)
    pub blur_kernel: usize,
    pub calibration_samples: usize,
    pub threshold_margin: f64,
    pub dwell_margin_ms: u64,
    pub flake_pixel_cutoff: usize,
    pub highlight_band: f64,
    pub crop_half_width: u32,
    pub crop_aspect: f64,
    pub um_per_px: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            blur_kernel: 9,
            calibration_samples: 5,
            threshold_margin: 5.0,
            dwell_margin_ms: 1_000,
            flake_pixel_cutoff: 100,
            highlight_band: 23.0,
            crop_half_width: 200,
            crop_aspect: 0.8,
            um_per_px: 0.422,
        }
    }
}

/// Where sessions are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("Grid_Scans"),
        }
    }
}

/// Frame-to-stage geometry used when navigating back to a flake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub px_per_um: f64,
    pub center_offset_x: i64,
    pub center_offset_y: i64,
    pub objective_50x_shift: (i64, i64),
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            px_per_um: 1280.0 / 520.0,
            center_offset_x: 8_500,
            center_offset_y: 7_300,
            objective_50x_shift: (-1_036, 4_319),
        }
    }
}

/// A bright patch placed on the simulated substrate, in stage steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedFlake {
    pub x: i64,
    pub y: i64,
    pub radius: i64,
    pub brightness: u8,
}

/// Parameters of the simulated rig the binary drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub width: u32,
    pub height: u32,
    pub background: u8,
    pub noise: u8,
    pub seed: u64,
    /// Stage speed in steps per second
    pub steps_per_second: f64,
    pub flakes: Vec<SimulatedFlake>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 256,
            background: 60,
            noise: 6,
            seed: 7,
            steps_per_second: 2_000_000.0,
            flakes: vec![
                SimulatedFlake {
                    x: 113_000,
                    y: 60_000,
                    radius: 900,
                    brightness: 140,
                },
                SimulatedFlake {
                    x: 301_000,
                    y: 229_000,
                    radius: 1_400,
                    brightness: 120,
                },
            ],
        }
    }
}

impl ScanConfig {
    /// Load from a specific TOML file and the environment.
    ///
    /// A missing file is not an error: the defaults describe the real setup.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(ScanConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FLAKESCAN_").split("__"))
            .extract()
            .map_err(|err| ConfigError::LoadError(Box::new(err)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.grid.x_increment <= 0 || self.grid.y_increment <= 0 {
            return Err(ConfigError::ValidationError(format!(
                "Grid increments must be positive (x={}, y={})",
                self.grid.x_increment, self.grid.y_increment
            )));
        }
        if self.grid.travel_range_um < 0.0 || self.grid.steps_per_um <= 0.0 {
            return Err(ConfigError::ValidationError(
                "travel_range_um must be >= 0 and steps_per_um > 0".to_string(),
            ));
        }

        let kernel = self.detection.blur_kernel;
        if kernel == 0 || kernel % 2 == 0 {
            return Err(ConfigError::ValidationError(format!(
                "blur_kernel must be a positive odd number, got {kernel}"
            )));
        }
        if self.detection.calibration_samples == 0 {
            return Err(ConfigError::ValidationError(
                "calibration_samples must be at least 1".to_string(),
            ));
        }
        if self.detection.um_per_px <= 0.0 || self.review.px_per_um <= 0.0 {
            return Err(ConfigError::ValidationError(
                "Pixel scale factors must be positive".to_string(),
            ));
        }

        if self.simulation.width == 0 || self.simulation.height == 0 {
            return Err(ConfigError::ValidationError(
                "Simulated frame dimensions must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ScanConfig::default();
        assert!(config.validate().is_ok());
        // 12 mm at ~34.56 steps/um
        assert_eq!(config.grid.travel_range_steps(), 414_660);
        assert_eq!(config.grid.y_offset_steps(), 17_278);
    }

    #[test]
    fn test_even_kernel_rejected() {
        let mut config = ScanConfig::default();
        config.detection.blur_kernel = 8;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("blur_kernel"));
    }

    #[test]
    fn test_toml_and_env_layering() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "scan.toml",
                r#"
                [detection]
                flake_pixel_cutoff = 250

                [grid]
                x_increment = 20000
                "#,
            )?;
            jail.set_env("FLAKESCAN_DETECTION__THRESHOLD_MARGIN", "7.5");

            let config = ScanConfig::load_from("scan.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.detection.flake_pixel_cutoff, 250);
            assert_eq!(config.grid.x_increment, 20_000);
            assert_eq!(config.grid.y_increment, 14_100);
            assert_eq!(config.detection.threshold_margin, 7.5);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = ScanConfig::load_from("absent.toml").map_err(|e| e.to_string())?;
            assert_eq!(config, ScanConfig::default());
            Ok(())
        });
    }
}
