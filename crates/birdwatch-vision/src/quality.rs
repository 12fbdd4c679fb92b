//! Variance-of-Laplacian sharpness measure.
//!
//! The frame is reduced to 8-bit intensity with BT.601 weights and
//! convolved with the 4-connected kernel `[0 1 0; 1 -4 1; 0 1 0]` using
//! reflect-101 borders. The population variance of the full response is
//! the sharpness score.

use birdwatch_types::vision::{Frame, QualityReport};

#[derive(Debug, Clone, Copy)]
pub struct QualityGate {
    threshold: f64,
}

impl QualityGate {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn assess(&self, frame: &Frame) -> QualityReport {
        assess(frame, self.threshold)
    }
}

pub fn assess(frame: &Frame, threshold: f64) -> QualityReport {
    let sharpness_score = match to_intensity(frame) {
        Some(gray) => laplacian_variance(&gray, frame.width as usize, frame.height as usize),
        None => 0.0,
    };
    QualityReport {
        sharpness_score,
        is_blurred: sharpness_score < threshold,
    }
}

/// Single-channel intensity plane, or `None` when the buffer is shorter
/// than the declared dimensions.
pub fn to_intensity(frame: &Frame) -> Option<Vec<u8>> {
    let channels = frame.channels.max(1) as usize;
    let needed = frame.pixel_count() * channels;
    if frame.data.len() < needed {
        return None;
    }
    let gray = frame.data[..needed]
        .chunks_exact(channels)
        .map(|px| match px {
            [r, g, b, ..] => {
                (0.299 * *r as f64 + 0.587 * *g as f64 + 0.114 * *b as f64).round() as u8
            }
            [v, ..] => *v,
            [] => 0,
        })
        .collect();
    Some(gray)
}

pub fn laplacian_variance(gray: &[u8], width: usize, height: usize) -> f64 {
    let count = width * height;
    if count == 0 || gray.len() < count {
        return 0.0;
    }

    let at = |x: isize, y: isize| -> f64 {
        let xi = reflect101(x, width);
        let yi = reflect101(y, height);
        gray[yi * width + xi] as f64
    };

    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for y in 0..height as isize {
        for x in 0..width as isize {
            let response =
                at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            sum += response;
            sum_sq += response * response;
        }
    }
    let n = count as f64;
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

fn reflect101(i: isize, len: usize) -> usize {
    let n = len as isize;
    if n <= 1 {
        return 0;
    }
    let reflected = if i < 0 {
        -i
    } else if i >= n {
        2 * n - 2 - i
    } else {
        i
    };
    reflected.clamp(0, n - 1) as usize
}
