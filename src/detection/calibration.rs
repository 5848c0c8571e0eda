//! Dynamic threshold calibration.
//!
//! Before a scan the first few plan positions are visited once. Each frame is
//! smoothed and its maximum recorded; the median maximum plus a margin is the
//! brightness threshold for the whole scan. The median move+capture time plus
//! a margin becomes the dwell estimate used for remaining-time reporting.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use super::blur::{gaussian_blur, max_intensity};
use crate::config::{DetectionConfig, ScanConfig};
use crate::error::{ScanError, ScanResult};
use crate::hardware::motion::move_to_xy;
use crate::hardware::{CameraController, StageController};
use crate::scan::plan::Position;

/// Threshold and dwell estimate, fixed for the rest of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdModel {
    pub threshold: f64,
    pub expected_dwell: Duration,
}

/// Samples the first positions of a plan to derive a [`ThresholdModel`].
#[derive(Debug, Clone)]
pub struct ThresholdCalibrator {
    pub kernel: usize,
    pub samples: usize,
    pub threshold_margin: f64,
    pub dwell_margin: Duration,
    pub motion_timeout: Duration,
    pub settle: Duration,
}

impl ThresholdCalibrator {
    pub fn from_config(config: &ScanConfig) -> Self {
        let DetectionConfig {
            blur_kernel,
            calibration_samples,
            threshold_margin,
            dwell_margin_ms,
            ..
        } = config.detection;
        Self {
            kernel: blur_kernel,
            samples: calibration_samples,
            threshold_margin,
            dwell_margin: Duration::from_millis(dwell_margin_ms),
            motion_timeout: config.stage.motion_timeout(),
            settle: Duration::from_millis(config.camera.settle_ms),
        }
    }

    /// Visit the first `samples` of `sample_positions` and derive the model.
    ///
    /// Any device failure aborts calibration; there is no partial result.
    pub async fn calibrate(
        &self,
        stage: &dyn StageController,
        camera: &dyn CameraController,
        sample_positions: &[Position],
    ) -> ScanResult<ThresholdModel> {
        let count = self.samples.min(sample_positions.len());
        if count == 0 {
            return Err(ScanError::Calibration(
                "no positions available to sample".to_string(),
            ));
        }

        let mut maxima = Vec::with_capacity(count);
        let mut durations = Vec::with_capacity(count);
        for (i, position) in sample_positions.iter().take(count).enumerate() {
            let started = Instant::now();
            move_to_xy(stage, position.x, position.y, self.motion_timeout)
                .await
                .map_err(|e| ScanError::Calibration(format!("sample {i} at {position}: {e}")))?;
            sleep(self.settle).await;
            let frame = camera
                .capture_frame()
                .await
                .map_err(|e| ScanError::Calibration(format!("sample {i} at {position}: {e}")))?;

            let peak = max_intensity(&gaussian_blur(&frame, self.kernel));
            let elapsed = started.elapsed();
            debug!(sample = i, %position, peak, ?elapsed, "Calibration sample");
            maxima.push(f64::from(peak));
            durations.push(elapsed);
        }

        let model = ThresholdModel {
            threshold: median(&mut maxima) + self.threshold_margin,
            expected_dwell: median_duration(&mut durations) + self.dwell_margin,
        };
        info!(
            threshold = model.threshold,
            dwell = ?model.expected_dwell,
            samples = count,
            "Calibration complete"
        );
        Ok(model)
    }
}

/// Median of a non-empty slice; even counts average the middle pair.
pub fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn median_duration(values: &mut [Duration]) -> Duration {
    if values.is_empty() {
        return Duration::ZERO;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Frame, MockCamera, MockStage};

    fn calibrator() -> ThresholdCalibrator {
        ThresholdCalibrator {
            kernel: 9,
            samples: 5,
            threshold_margin: 5.0,
            dwell_margin: Duration::from_secs(1),
            motion_timeout: Duration::from_secs(5),
            settle: Duration::from_millis(100),
        }
    }

    fn positions(n: i64) -> Vec<Position> {
        (0..n).map(|i| Position::new(i * 100, 0)).collect()
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&mut [4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(median(&mut [200.0; 5]), 200.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_constant_frames_give_max_plus_margin() {
        let stage = MockStage::new();
        let camera = MockCamera::scripted(vec![Frame::filled(32, 32, 200); 5]);
        let model = calibrator()
            .calibrate(&stage, &camera, &positions(8))
            .await
            .unwrap();
        assert_eq!(model.threshold, 205.0);
        assert_eq!(camera.frame_count(), 5);
        // 100 ms settle + 1 s margin; travel is sub-millisecond
        assert_eq!(model.expected_dwell, Duration::from_millis(1_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_outlier_ignored() {
        let mut frames = vec![Frame::filled(16, 16, 100); 5];
        frames[2] = Frame::filled(16, 16, 250);
        let camera = MockCamera::scripted(frames);
        let model = calibrator()
            .calibrate(&MockStage::new(), &camera, &positions(5))
            .await
            .unwrap();
        assert_eq!(model.threshold, 105.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_plan_samples_what_exists() {
        let camera = MockCamera::scripted(vec![Frame::filled(8, 8, 40)]);
        let model = calibrator()
            .calibrate(&MockStage::new(), &camera, &positions(2))
            .await
            .unwrap();
        assert_eq!(camera.frame_count(), 2);
        assert_eq!(model.threshold, 45.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_failure_aborts() {
        let camera = MockCamera::new(8, 8);
        camera.fail_on_capture(3);
        let err = calibrator()
            .calibrate(&MockStage::new(), &camera, &positions(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Calibration(_)));
        assert_eq!(camera.frame_count(), 3);
    }

    #[tokio::test]
    async fn test_empty_plan_is_error() {
        let err = calibrator()
            .calibrate(&MockStage::new(), &MockCamera::new(4, 4), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Calibration(_)));
    }
}
