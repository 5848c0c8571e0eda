//! Separable Gaussian smoothing.
//!
//! Single hot or dead pixels would otherwise dominate the per-frame maximum
//! used for calibration. The kernel is applied once along rows and once along
//! columns; border samples mirror around the edge pixel without repeating it
//! (`dcb|abcd|cba`).

use crate::hardware::Frame;

/// Normalised 1D Gaussian taps for an odd `kernel` size.
///
/// Sigma follows the usual size-derived rule
/// `0.3 * ((kernel - 1) / 2 - 1) + 0.8`.
pub fn gaussian_taps(kernel: usize) -> Vec<f32> {
    let kernel = kernel.max(1) | 1;
    let centre = (kernel / 2) as f32;
    let sigma = 0.3 * (centre - 1.0) + 0.8;
    let denom = 2.0 * sigma * sigma;

    let mut taps: Vec<f32> = (0..kernel)
        .map(|i| {
            let d = i as f32 - centre;
            (-(d * d) / denom).exp()
        })
        .collect();
    let sum: f32 = taps.iter().sum();
    for tap in &mut taps {
        *tap /= sum;
    }
    taps
}

#[inline]
fn reflect_101(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let n = n as isize;
    let mut i = i;
    while i < 0 || i >= n {
        i = if i < 0 { -i } else { 2 * n - 2 - i };
    }
    i as usize
}

/// Gaussian-blur `frame` with a `kernel`×`kernel` window.
pub fn gaussian_blur(frame: &Frame, kernel: usize) -> Frame {
    if frame.is_empty() {
        return frame.clone();
    }
    let taps = gaussian_taps(kernel);
    let radius = (taps.len() / 2) as isize;
    let w = frame.width() as usize;
    let h = frame.height() as usize;
    let src = frame.pixels();

    // Horizontal pass into f32
    let mut tmp = vec![0f32; w * h];
    for y in 0..h {
        let row = &src[y * w..(y + 1) * w];
        let dst = &mut tmp[y * w..(y + 1) * w];
        for (x, out) in dst.iter_mut().enumerate() {
            let mut acc = 0f32;
            for (k, tap) in taps.iter().enumerate() {
                let sx = reflect_101(x as isize + k as isize - radius, w);
                acc += tap * f32::from(row[sx]);
            }
            *out = acc;
        }
    }

    // Vertical pass, rounded back to u8
    let mut out = Frame::filled(frame.width(), frame.height(), 0);
    let pixels = out.pixels_mut();
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0f32;
            for (k, tap) in taps.iter().enumerate() {
                let sy = reflect_101(y as isize + k as isize - radius, h);
                acc += tap * tmp[sy * w + x];
            }
            pixels[y * w + x] = acc.round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

/// Highest intensity in the frame (0 for an empty frame).
pub fn max_intensity(frame: &Frame) -> u8 {
    frame.pixels().iter().copied().max().unwrap_or(0)
}
