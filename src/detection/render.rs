//! Derived renderings stored for flake-positive captures.
//!
//! Three views are produced from the raw frame: the full field with a scale
//! bar, a crop centred on the brightest pixel, and a binary mask of the pixels
//! whose raw intensity lies in the band just above the threshold.

use super::classifier::Classification;
use crate::config::DetectionConfig;
use crate::hardware::Frame;

/// Scale bar lengths tried, longest first.
const SCALE_BAR_UM: [f64; 9] = [500.0, 200.0, 100.0, 50.0, 20.0, 10.0, 5.0, 2.0, 1.0];
const SCALE_BAR_MARGIN: u32 = 10;
const SCALE_BAR_THICKNESS: u32 = 4;

/// The three images written for a flake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlakeRenderings {
    pub uncropped: Frame,
    pub zoomed: Frame,
    pub highlighted: Frame,
}

/// Render all views of a flake-positive frame.
pub fn render_flake(
    frame: &Frame,
    classification: &Classification,
    threshold: f64,
    detection: &DetectionConfig,
) -> FlakeRenderings {
    let mut uncropped = frame.clone();
    draw_scale_bar(&mut uncropped, detection.um_per_px);

    let mut zoomed = crop_around(
        frame,
        classification.peak,
        detection.crop_half_width,
        detection.crop_aspect,
    );
    draw_scale_bar(&mut zoomed, detection.um_per_px);

    let mut highlighted = highlight_band(frame, threshold, detection.highlight_band);
    draw_scale_bar(&mut highlighted, detection.um_per_px);

    FlakeRenderings {
        uncropped,
        zoomed,
        highlighted,
    }
}

/// Crop a window of `2·half_width` by `2·half_width·aspect` pixels centred on
/// `peak`, clipped to the frame.
pub fn crop_around(frame: &Frame, peak: (u32, u32), half_width: u32, aspect: f64) -> Frame {
    let half_height = (f64::from(half_width) * aspect).round() as u32;
    let (px, py) = peak;
    let x0 = px.saturating_sub(half_width);
    let y0 = py.saturating_sub(half_height);
    let x1 = px.saturating_add(half_width).min(frame.width());
    let y1 = py.saturating_add(half_height).min(frame.height());
    if x0 >= x1 || y0 >= y1 {
        return Frame::filled(0, 0, 0);
    }

    let (w, h) = (x1 - x0, y1 - y0);
    let mut crop = Frame::filled(w, h, 0);
    let src = frame.pixels();
    for (dy, dst) in crop.pixels_mut().chunks_exact_mut(w as usize).enumerate() {
        let row = ((y0 + dy as u32) * frame.width()) as usize;
        dst.copy_from_slice(&src[row + x0 as usize..row + x1 as usize]);
    }
    crop
}

/// 255 where `threshold <= value <= threshold + band`, else 0.
pub fn highlight_band(frame: &Frame, threshold: f64, band: f64) -> Frame {
    let upper = threshold + band;
    frame.map(|v| {
        let v = f64::from(v);
        if v >= threshold && v <= upper {
            255
        } else {
            0
        }
    })
}

/// Draw a white bar in the lower-right corner whose length is a round number
/// of micrometres no longer than a quarter of the frame width.
///
/// Returns the bar length in micrometres, or `None` if the frame is too small.
pub fn draw_scale_bar(frame: &mut Frame, um_per_px: f64) -> Option<f64> {
    if um_per_px <= 0.0 || frame.height() <= SCALE_BAR_MARGIN + SCALE_BAR_THICKNESS {
        return None;
    }
    let max_px = f64::from(frame.width() / 4);
    let (length_um, length_px) = SCALE_BAR_UM
        .iter()
        .map(|&um| (um, (um / um_per_px).round()))
        .find(|&(_, px)| px >= 1.0 && px <= max_px)?;

    let length_px = length_px as u32;
    let x1 = frame.width().saturating_sub(SCALE_BAR_MARGIN);
    let x0 = x1.saturating_sub(length_px);
    let y1 = frame.height() - SCALE_BAR_MARGIN;
    let y0 = y1 - SCALE_BAR_THICKNESS;
    for y in y0..y1 {
        for x in x0..x1 {
            frame.set(x, y, 255);
        }
    }
    Some(length_um)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_centred_inside_frame() {
        let frame = Frame::filled(1280, 1024, 7);
        let crop = crop_around(&frame, (640, 512), 200, 0.8);
        assert_eq!((crop.width(), crop.height()), (400, 320));
    }

    #[test]
    fn test_crop_clipped_at_corner() {
        let mut frame = Frame::filled(100, 80, 0);
        frame.set(0, 0, 42);
        let crop = crop_around(&frame, (5, 5), 20, 0.5);
        assert_eq!((crop.width(), crop.height()), (25, 15));
        assert_eq!(crop.get(0, 0), 42);
    }

    #[test]
    fn test_highlight_band_is_inclusive() {
        let frame = Frame::from_pixels(5, 1, vec![99, 100, 110, 123, 124]).unwrap();
        let mask = highlight_band(&frame, 100.0, 23.0);
        assert_eq!(mask.pixels(), &[0, 255, 255, 255, 0]);
    }

    #[test]
    fn test_scale_bar_length() {
        // 0.422 um/px on 1280 px: 100 um = 237 px fits in 320, 200 um does not
        let mut frame = Frame::filled(1280, 1024, 0);
        assert_eq!(draw_scale_bar(&mut frame, 0.422), Some(100.0));
        assert_eq!(frame.get(1269, 1013), 255);
        assert_eq!(frame.get(1270, 1013), 0);
        let lit = frame.pixels().iter().filter(|&&p| p == 255).count();
        assert_eq!(lit, 237 * 4);
    }

    #[test]
    fn test_scale_bar_skipped_on_tiny_frame() {
        let mut frame = Frame::filled(8, 8, 0);
        assert_eq!(draw_scale_bar(&mut frame, 0.422), None);
        assert!(frame.pixels().iter().all(|&p| p == 0));
    }

    #[test]
    fn test_render_flake_shapes() {
        let frame = Frame::filled(640, 512, 120);
        let classification = Classification {
            is_flake: true,
            score: 500,
            peak: (320, 256),
        };
        let views = render_flake(&frame, &classification, 110.0, &DetectionConfig::default());
        assert_eq!((views.uncropped.width(), views.uncropped.height()), (640, 512));
        assert_eq!((views.zoomed.width(), views.zoomed.height()), (400, 320));
        // 120 lies in [110, 133]
        assert_eq!(views.highlighted.get(0, 0), 255);
    }
}
