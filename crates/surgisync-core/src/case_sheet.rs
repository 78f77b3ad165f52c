//! Case-sheet boundary detection.
//!
//! Recordings often open with a slate showing patient identifiers. Slates are
//! flat and low-texture, so their per-second sharpness (variance of the
//! Laplacian) is far below that of live surgical footage. The detector
//! smooths the sharpness signal, slides a fixed window over it, and reports
//! the last window whose mean falls below the threshold.

use serde::{Deserialize, Serialize};

use crate::config::CaseSheetSettings;

/// Gaussian kernel radius in standard deviations
const TRUNCATE: f64 = 4.0;

/// A detected case-sheet window, in sample indices (one sample per second).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSheetWindow {
    pub start: usize,
    pub end: usize,
}

impl CaseSheetWindow {
    /// Where the anonymized copy should start.
    pub fn clip_start_seconds(&self) -> f64 {
        self.end as f64
    }
}

#[derive(Debug, Clone)]
pub struct CaseSheetDetector {
    threshold: f64,
    window: usize,
    sigma: f64,
}

impl CaseSheetDetector {
    pub fn new(threshold: f64, window: usize, sigma: f64) -> Self {
        Self {
            threshold,
            window,
            sigma,
        }
    }

    pub fn from_settings(settings: &CaseSheetSettings) -> Self {
        Self::new(
            settings.variance_threshold,
            settings.window_size,
            settings.smoothing_sigma,
        )
    }

    /// Smooth `variances` and scan for the case-sheet window.
    pub fn detect(&self, variances: &[f64]) -> Option<CaseSheetWindow> {
        let smoothed = gaussian_smooth(variances, self.sigma);
        last_window_below(&smoothed, self.window, self.threshold).map(|start| CaseSheetWindow {
            start,
            end: start + self.window,
        })
    }
}

/// Start of the last window (scanning forward) whose mean is below
/// `threshold`. Starts range over `0..=len - window`; a signal shorter than
/// the window has no candidates.
///
/// Later matches replace earlier ones, so low-texture content anywhere in the
/// sampled range pushes the boundary later.
pub fn last_window_below(signal: &[f64], window: usize, threshold: f64) -> Option<usize> {
    if window == 0 || signal.len() < window {
        return None;
    }
    let mut last = None;
    for start in 0..=signal.len() - window {
        let mean = signal[start..start + window].iter().sum::<f64>() / window as f64;
        if mean < threshold {
            last = Some(start);
        }
    }
    last
}

/// 1-D Gaussian filter with a normalized kernel of radius `round(4σ)` and
/// half-sample symmetric boundaries (`d c b a | a b c d | d c b a`).
pub fn gaussian_smooth(signal: &[f64], sigma: f64) -> Vec<f64> {
    if signal.is_empty() || sigma <= 0.0 {
        return signal.to_vec();
    }
    let radius = (TRUNCATE * sigma + 0.5) as isize;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|x| (-0.5 * (x * x) as f64 / (sigma * sigma)).exp())
        .collect();
    let total: f64 = kernel.iter().sum();
    for w in kernel.iter_mut() {
        *w /= total;
    }

    let n = signal.len();
    (0..n as isize)
        .map(|i| {
            kernel
                .iter()
                .enumerate()
                .map(|(k, w)| w * signal[reflect_index(i + k as isize - radius, n)])
                .sum()
        })
        .collect()
}

fn reflect_index(i: isize, n: usize) -> usize {
    let period = 2 * n as isize;
    let m = i.rem_euclid(period);
    if m < n as isize {
        m as usize
    } else {
        (period - 1 - m) as usize
    }
}

/// Variance of the 3x3 Laplacian (`[0 1 0; 1 -4 1; 0 1 0]`) over a grayscale
/// frame, borders mirrored without repeating the edge pixel.
pub fn laplacian_variance(gray: &[u8], width: usize, height: usize) -> f64 {
    if width == 0 || height == 0 || gray.len() < width * height {
        return 0.0;
    }
    let px = |x: isize, y: isize| -> f64 {
        let x = reflect101(x, width);
        let y = reflect101(y, height);
        gray[y * width + x] as f64
    };

    let count = (width * height) as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for y in 0..height as isize {
        for x in 0..width as isize {
            let lap = px(x, y - 1) + px(x - 1, y) + px(x + 1, y) + px(x, y + 1) - 4.0 * px(x, y);
            sum += lap;
            sum_sq += lap * lap;
        }
    }
    let mean = sum / count;
    (sum_sq / count - mean * mean).max(0.0)
}

fn reflect101(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let last = n as isize - 1;
    let period = 2 * last;
    let m = i.rem_euclid(period);
    if m <= last {
        m as usize
    } else {
        (period - m) as usize
    }
}
