//! Frame quality classification for raw IR frames
//!
//! Detects the two artifacts this camera produces most often:
//! - Interleaving stripes (two byte streams alternating, high neighbour diff)
//! - Dark or empty frames (low mean brightness)
//!
//! Both signals are computed over a fixed leading window of the frame so the
//! cost per frame is constant. The thresholds are empirical heuristics tuned
//! against captures from this sensor, not derived from a device model.

use serde::{Deserialize, Serialize};

/// Number of leading bytes examined per frame.
pub const SAMPLE_WINDOW: usize = 4000;

/// Neighbour-difference above which a frame is considered striped.
pub const STRIPE_THRESHOLD: f64 = 25.0;

/// Default mean brightness below which a frame is considered dark.
pub const DEFAULT_DARK_THRESHOLD: u8 = 15;

/// Classifier thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Interleave detector threshold
    pub stripe_threshold: f64,
    /// Dark detector threshold (strictly below is dark)
    pub dark_threshold: u8,
    /// Leading bytes examined
    pub sample_window: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            stripe_threshold: STRIPE_THRESHOLD,
            dark_threshold: DEFAULT_DARK_THRESHOLD,
            sample_window: SAMPLE_WINDOW,
        }
    }
}

/// Per-frame quality signals
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualitySignals {
    /// Mean absolute difference between adjacent bytes
    pub neighbor_diff: f64,
    /// Integer mean of the sampled bytes
    pub mean_brightness: u8,
    /// Frame length in bytes
    pub len: usize,
}

/// Classifier verdict with the signals behind it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    /// Raw signals
    pub signals: QualitySignals,
    /// Neighbour diff exceeded the stripe threshold
    pub interleaved: bool,
    /// Mean brightness fell below the dark threshold
    pub too_dark: bool,
}

/// Mean absolute difference of adjacent bytes over the first `window` bytes.
///
/// Returns 0.0 for frames shorter than two bytes. A smooth thermal image
/// stays in the single digits, alternating streams push this far above 25.
pub fn neighbor_diff(frame: &[u8], window: usize) -> f64 {
    let n = frame.len().min(window);
    if n < 2 {
        return 0.0;
    }

    let sum: u64 = frame[..n]
        .windows(2)
        .map(|pair| u64::from(pair[0].abs_diff(pair[1])))
        .sum();

    sum as f64 / (n - 1) as f64
}

/// Integer mean of the first `window` bytes, 0 for an empty frame.
pub fn mean_brightness(frame: &[u8], window: usize) -> u8 {
    let n = frame.len().min(window);
    if n == 0 {
        return 0;
    }

    let sum: u64 = frame[..n].iter().map(|&b| u64::from(b)).sum();
    (sum / n as u64) as u8
}

/// Compute both quality signals for a frame.
pub fn quality_signals(frame: &[u8], window: usize) -> QualitySignals {
    QualitySignals {
        neighbor_diff: neighbor_diff(frame, window),
        mean_brightness: mean_brightness(frame, window),
        len: frame.len(),
    }
}

/// Classify a frame against the configured thresholds.
pub fn classify(frame: &[u8], config: &ClassifierConfig) -> Classification {
    let signals = quality_signals(frame, config.sample_window);
    Classification {
        signals,
        interleaved: signals.neighbor_diff > config.stripe_threshold,
        too_dark: signals.mean_brightness < config.dark_threshold,
    }
}

/// Whole-frame byte statistics, used by the diagnostic dump.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameStats {
    /// Smallest byte value
    pub min: u8,
    /// Largest byte value
    pub max: u8,
    /// Mean over all bytes
    pub mean: f64,
}

impl FrameStats {
    /// Compute statistics over every byte, `None` for an empty frame.
    pub fn compute(frame: &[u8]) -> Option<Self> {
        let (&first, _) = frame.split_first()?;
        let (min, max, sum) = frame.iter().fold(
            (first, first, 0u64),
            |(min, max, sum), &b| (min.min(b), max.max(b), sum + u64::from(b)),
        );
        Some(Self {
            min,
            max,
            mean: sum as f64 / frame.len() as f64,
        })
    }
}
