//! Hold/lock stability filter
//!
//! Decides whether a classified frame is shown. Gates run in a fixed order
//! and the first one that rejects wins:
//!
//! 1. stripe filter (interleaved frames)
//! 2. size band around the locked size (hold mode only)
//! 3. dark frames
//! 4. brightness jump against the last accepted frame (hold mode only)
//!
//! Frames that pass become the held frame. With hold enabled, the very first
//! accepted frame since startup also fixes the size lock. That auto-lock is
//! kept on purpose but is a policy choice worth revisiting with users.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::frame_validation::{classify, ClassifierConfig, QualitySignals};

/// Default size band half-width in percent.
pub const DEFAULT_SIZE_TOLERANCE_PCT: u32 = 20;

/// Default maximum brightness change between accepted frames.
pub const DEFAULT_BRIGHTNESS_TOLERANCE: u8 = 40;

/// Amount the dark threshold drops per request.
pub const DARK_THRESHOLD_STEP: u8 = 5;

/// Why a frame was not displayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Shorter than the minimum fragment length
    Fragment,
    /// Classified as interleaved or noise
    Interleaved,
    /// Outside the locked size band
    SizeOutOfBand,
    /// Mean brightness below the dark threshold
    TooDark,
    /// Brightness moved too far from the held frame
    BrightnessJump,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fragment => "fragment",
            Self::Interleaved => "interleaved",
            Self::SizeOutOfBand => "size",
            Self::TooDark => "dark",
            Self::BrightnessJump => "brightness",
        };
        f.write_str(name)
    }
}

/// Per-reason rejection counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectCounters {
    /// Frames under the fragment length
    pub fragment: u64,
    /// Stripe filter hits
    pub stripe: u64,
    /// Size band misses
    pub size: u64,
    /// Dark frames
    pub dark: u64,
    /// Brightness jumps
    pub brightness: u64,
}

impl RejectCounters {
    /// Bump the counter for `reason`.
    pub fn record(&mut self, reason: RejectReason) {
        let slot = match reason {
            RejectReason::Fragment => &mut self.fragment,
            RejectReason::Interleaved => &mut self.stripe,
            RejectReason::SizeOutOfBand => &mut self.size,
            RejectReason::TooDark => &mut self.dark,
            RejectReason::BrightnessJump => &mut self.brightness,
        };
        *slot += 1;
    }

    /// Count for a single reason.
    pub fn get(&self, reason: RejectReason) -> u64 {
        match reason {
            RejectReason::Fragment => self.fragment,
            RejectReason::Interleaved => self.stripe,
            RejectReason::SizeOutOfBand => self.size,
            RejectReason::TooDark => self.dark,
            RejectReason::BrightnessJump => self.brightness,
        }
    }

    /// Sum over all reasons.
    pub fn total(&self) -> u64 {
        self.fragment + self.stripe + self.size + self.dark + self.brightness
    }
}

/// Outcome of [`StabilityFilter::evaluate`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Frame should be displayed
    Accepted(QualitySignals),
    /// Frame was filtered out
    Rejected(RejectReason, QualitySignals),
}

impl Verdict {
    /// Whether the frame passed every gate.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// Signals computed for the frame.
    pub fn signals(&self) -> &QualitySignals {
        match self {
            Self::Accepted(signals) | Self::Rejected(_, signals) => signals,
        }
    }

    /// Rejection reason, if any.
    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Self::Accepted(_) => None,
            Self::Rejected(reason, _) => Some(*reason),
        }
    }
}

/// Stability filter settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Reject interleaved frames
    pub stripe_filter: bool,
    /// Hold mode: size lock and brightness baseline
    pub hold: bool,
    /// Size band half-width in percent of the locked size
    pub size_tolerance_pct: u32,
    /// Maximum brightness change between accepted frames
    pub brightness_tolerance: u8,
    /// Classifier thresholds
    pub classifier: ClassifierConfig,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            stripe_filter: true,
            hold: true,
            size_tolerance_pct: DEFAULT_SIZE_TOLERANCE_PCT,
            brightness_tolerance: DEFAULT_BRIGHTNESS_TOLERANCE,
            classifier: ClassifierConfig::default(),
        }
    }
}

/// Hold/lock state machine owned by the control loop
#[derive(Debug)]
pub struct StabilityFilter {
    config: StabilityConfig,
    locked_size: Option<usize>,
    held_frame: Option<Vec<u8>>,
    held_brightness: Option<u8>,
    accepted_total: u64,
    counters: RejectCounters,
}

impl StabilityFilter {
    /// Create an unlocked filter.
    pub fn new(config: StabilityConfig) -> Self {
        Self {
            config,
            locked_size: None,
            held_frame: None,
            held_brightness: None,
            accepted_total: 0,
            counters: RejectCounters::default(),
        }
    }

    /// Run a frame through every gate, updating state on acceptance.
    pub fn evaluate(&mut self, frame: &[u8]) -> Verdict {
        let classification = classify(frame, &self.config.classifier);
        let signals = classification.signals;

        if self.config.stripe_filter && classification.interleaved {
            return self.reject(RejectReason::Interleaved, signals);
        }

        if self.config.hold {
            if let Some((lo, hi)) = self.size_band() {
                if frame.len() < lo || frame.len() > hi {
                    return self.reject(RejectReason::SizeOutOfBand, signals);
                }
            }
        }

        if classification.too_dark {
            return self.reject(RejectReason::TooDark, signals);
        }

        if self.config.hold {
            if let Some(held) = self.held_brightness {
                if signals.mean_brightness.abs_diff(held) > self.config.brightness_tolerance {
                    return self.reject(RejectReason::BrightnessJump, signals);
                }
            }
        }

        if self.config.hold {
            self.held_frame = Some(frame.to_vec());
            self.held_brightness = Some(signals.mean_brightness);

            if self.locked_size.is_none() && self.accepted_total == 0 {
                self.locked_size = Some(frame.len());
                log::info!(
                    "Auto-locked to size band: {} +/-{}%",
                    frame.len(),
                    self.config.size_tolerance_pct
                );
            }
        }

        self.accepted_total += 1;
        Verdict::Accepted(signals)
    }

    /// Count a rejection decided outside the filter (fragment gate).
    pub fn record_rejection(&mut self, reason: RejectReason) {
        self.counters.record(reason);
    }

    fn reject(&mut self, reason: RejectReason, signals: QualitySignals) -> Verdict {
        self.counters.record(reason);
        log::debug!(
            "Rejected {} byte frame: {} (avg={}, nd={:.1})",
            signals.len,
            reason,
            signals.mean_brightness,
            signals.neighbor_diff
        );
        Verdict::Rejected(reason, signals)
    }

    /// Inclusive `[lo, hi]` size band, if locked.
    pub fn size_band(&self) -> Option<(usize, usize)> {
        let tol = self.config.size_tolerance_pct as usize;
        self.locked_size.map(|locked| {
            (
                locked * 100usize.saturating_sub(tol) / 100,
                locked * (100 + tol) / 100,
            )
        })
    }

    /// Lock to the held frame's size. No-op when nothing is held.
    ///
    /// Returns the new locked size.
    pub fn lock_to_held(&mut self) -> Option<usize> {
        let len = self.held_frame.as_ref().map(Vec::len).filter(|&len| len > 0)?;
        self.locked_size = Some(len);
        log::info!(
            "Locked to size band: {} +/-{}%",
            len,
            self.config.size_tolerance_pct
        );
        Some(len)
    }

    /// Drop the size lock.
    pub fn clear_lock(&mut self) {
        if self.locked_size.take().is_some() {
            log::info!("Cleared size lock");
        }
    }

    /// Lock to the held frame if there is one, otherwise clear the lock.
    pub fn toggle_lock(&mut self) -> Option<usize> {
        let locked = self.lock_to_held();
        if locked.is_none() {
            self.clear_lock();
        }
        locked
    }

    /// Enable or disable hold mode.
    ///
    /// Disabling clears the lock, the brightness baseline and the held frame.
    pub fn set_hold(&mut self, hold: bool) {
        self.config.hold = hold;
        if !hold {
            self.locked_size = None;
            self.held_brightness = None;
            self.held_frame = None;
        }
    }

    /// Enable or disable the stripe filter.
    pub fn set_stripe_filter(&mut self, enabled: bool) {
        self.config.stripe_filter = enabled;
    }

    /// Lower the dark threshold by one step, saturating at 0.
    pub fn lower_dark_threshold(&mut self) -> u8 {
        let threshold = &mut self.config.classifier.dark_threshold;
        *threshold = threshold.saturating_sub(DARK_THRESHOLD_STEP);
        *threshold
    }

    /// Active settings.
    pub fn config(&self) -> &StabilityConfig {
        &self.config
    }

    /// Whether hold mode is on.
    pub fn hold_enabled(&self) -> bool {
        self.config.hold
    }

    /// Whether the stripe filter is on.
    pub fn stripe_filter_enabled(&self) -> bool {
        self.config.stripe_filter
    }

    /// Current dark threshold.
    pub fn dark_threshold(&self) -> u8 {
        self.config.classifier.dark_threshold
    }

    /// Locked frame size, if any.
    pub fn locked_size(&self) -> Option<usize> {
        self.locked_size
    }

    /// Last accepted frame while hold was on.
    pub fn held_frame(&self) -> Option<&[u8]> {
        self.held_frame.as_deref()
    }

    /// Brightness of the held frame.
    pub fn held_brightness(&self) -> Option<u8> {
        self.held_brightness
    }

    /// Frames accepted since startup.
    pub fn accepted_total(&self) -> u64 {
        self.accepted_total
    }

    /// Per-reason rejection counts.
    pub fn counters(&self) -> &RejectCounters {
        &self.counters
    }
}

impl Default for StabilityFilter {
    fn default() -> Self {
        Self::new(StabilityConfig::default())
    }
}
