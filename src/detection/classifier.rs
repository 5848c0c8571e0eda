//! Per-frame flake detection.
//!
//! A frame is smoothed with the same Gaussian used during calibration, then
//! every pixel brighter than the scan threshold counts towards the score. A
//! flake is a large enough bright patch; isolated hot pixels never reach the
//! pixel cutoff after smoothing.

use serde::{Deserialize, Serialize};

use super::blur::gaussian_blur;
use crate::config::DetectionConfig;
use crate::hardware::Frame;

/// Outcome of classifying one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub is_flake: bool,
    /// Number of smoothed pixels strictly above the threshold
    pub score: u64,
    /// `(x, y)` of the brightest smoothed pixel, first in row-major order
    pub peak: (u32, u32),
}

/// Threshold classifier. Pure; holds only its tuning constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameClassifier {
    pub kernel: usize,
    pub pixel_cutoff: u64,
}

impl FrameClassifier {
    pub fn new(kernel: usize, pixel_cutoff: u64) -> Self {
        Self {
            kernel,
            pixel_cutoff,
        }
    }

    pub fn from_config(detection: &DetectionConfig) -> Self {
        Self::new(detection.blur_kernel, detection.flake_pixel_cutoff as u64)
    }

    /// Classify `frame` against `threshold`.
    pub fn classify(&self, frame: &Frame, threshold: f64) -> Classification {
        let blurred = gaussian_blur(frame, self.kernel);
        let width = blurred.width().max(1);

        let mut score = 0u64;
        let mut peak_idx = 0usize;
        let mut peak_val = 0u8;
        for (i, &value) in blurred.pixels().iter().enumerate() {
            if f64::from(value) > threshold {
                score += 1;
            }
            if value > peak_val {
                peak_val = value;
                peak_idx = i;
            }
        }

        let peak = ((peak_idx as u32) % width, (peak_idx as u32) / width);
        Classification {
            is_flake: score > self.pixel_cutoff,
            score,
            peak,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_patch(value: u8, side: u32) -> Frame {
        let mut frame = Frame::filled(64, 48, 50);
        for y in 10..10 + side {
            for x in 20..20 + side {
                frame.set(x, y, value);
            }
        }
        frame
    }

    #[test]
    fn test_bright_patch_is_flake() {
        let classifier = FrameClassifier::new(9, 100);
        let result = classifier.classify(&frame_with_patch(200, 20), 100.0);
        assert!(result.is_flake);
        assert!(result.score > 100);
        let (px, py) = result.peak;
        assert!((20..40).contains(&px) && (10..30).contains(&py));
    }

    #[test]
    fn test_dark_frame_is_not_flake() {
        let classifier = FrameClassifier::new(9, 100);
        let result = classifier.classify(&Frame::filled(64, 48, 50), 55.0);
        assert_eq!(result.score, 0);
        assert!(!result.is_flake);
    }

    #[test]
    fn test_score_at_cutoff_is_not_flake() {
        // Uniform frame: every pixel counts, 10 x 10 = 100
        let classifier = FrameClassifier::new(3, 100);
        let result = classifier.classify(&Frame::filled(10, 10, 90), 80.0);
        assert_eq!(result.score, 100);
        assert!(!result.is_flake);
        assert!(FrameClassifier::new(3, 99).classify(&Frame::filled(10, 10, 90), 80.0).is_flake);
    }

    #[test]
    fn test_peak_is_first_maximum() {
        let classifier = FrameClassifier::new(1, 0);
        let mut frame = Frame::filled(5, 4, 0);
        frame.set(3, 1, 9);
        frame.set(1, 2, 9);
        assert_eq!(classifier.classify(&frame, 0.0).peak, (3, 1));
    }

    #[test]
    fn test_classify_is_pure() {
        let classifier = FrameClassifier::new(9, 100);
        let frame = frame_with_patch(180, 15);
        assert_eq!(
            classifier.classify(&frame, 90.0),
            classifier.classify(&frame, 90.0)
        );
    }

    #[test]
    fn test_score_monotonic_in_threshold() {
        let classifier = FrameClassifier::new(9, 100);
        let frame = frame_with_patch(220, 18);
        let mut last = u64::MAX;
        for threshold in (0..=255).step_by(5) {
            let score = classifier.classify(&frame, f64::from(threshold)).score;
            assert!(score <= last);
            last = score;
        }
    }
}
