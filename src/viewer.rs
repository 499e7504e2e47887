//! Live viewer pipeline and control loop
//!
//! One loop owns every piece of mutable state: it applies pending user
//! controls, reads one frame, runs it through the pipeline and hands
//! accepted images to a [`FrameSink`]. There are no worker threads; the only
//! thing crossing a thread boundary is the control channel fed by stdin.
//!
//! Per frame, in order:
//!
//! 1. fragment gate (short reads are dropped and counted)
//! 2. vendor metadata prefix stripped
//! 3. optional accumulation up to the negotiated frame size
//! 4. stability filter (stripe, size band, dark, brightness jump)
//! 5. render with the current width and decode mode

use std::fmt;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::accumulator::Accumulator;
use crate::capture::save_raw_frame;
use crate::config::{ViewerConfig, MIN_WIDTH};
use crate::dump::hex_preview;
use crate::frame_assembler::{AssembledFrame, Boundary, FrameReader};
use crate::frame_validation::QualitySignals;
use crate::metadata::strip_metadata_header;
use crate::render::{DecodeMode, FrameSink, RenderedFrame};
use crate::stability::{RejectCounters, RejectReason, StabilityFilter};
use crate::transport::{PacketSource, RunFlag, TransportError};

/// Accepted frames logged in detail at startup.
const VERBOSE_FRAMES: u64 = 5;

/// Bytes shown in the per-frame hex preview.
const PREVIEW_BYTES: usize = 20;

/// A live control request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Cycle the decode mode
    CycleMode,
    /// Widen the display by this many pixels
    Widen(usize),
    /// Narrow the display by this many pixels
    Narrow(usize),
    /// Back to the configured width
    ResetWidth,
    /// Toggle the stripe filter
    ToggleStripeFilter,
    /// Toggle accumulation
    ToggleAccumulate,
    /// Toggle hold mode
    ToggleHold,
    /// Lock to the held frame, or clear the lock when nothing is held
    ToggleLock,
    /// Lower the dark threshold one step
    LowerBrightness,
    /// Save the next accepted frame
    SaveNext,
    /// Stop the viewer
    Quit,
}

impl Control {
    /// Parse one line of keyboard input.
    ///
    /// Doubled `+`/`-` are the shifted variants and move by 10.
    pub fn parse(input: &str) -> Option<Self> {
        let control = match input.trim().to_lowercase().as_str() {
            "m" => Self::CycleMode,
            "+" | "=" => Self::Widen(1),
            "++" | "==" => Self::Widen(10),
            "-" => Self::Narrow(1),
            "--" => Self::Narrow(10),
            "r" => Self::ResetWidth,
            "s" => Self::ToggleStripeFilter,
            "a" => Self::ToggleAccumulate,
            "h" => Self::ToggleHold,
            "l" => Self::ToggleLock,
            "b" => Self::LowerBrightness,
            "d" => Self::SaveNext,
            "q" | "quit" | "exit" | "esc" => Self::Quit,
            _ => return None,
        };
        Some(control)
    }
}

/// What happened to one assembled frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Accepted and rendered
    Displayed(RenderedFrame),
    /// Filtered out
    Rejected(RejectReason),
    /// Consumed by the accumulator, no frame yet
    Pending,
    /// Nothing to process
    Ignored,
}

/// Final counters of a viewer run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ViewerSummary {
    /// Frames that passed the fragment gate
    pub seen: u64,
    /// Frames displayed
    pub accepted: u64,
    /// Frames clipped at the capacity limit
    pub truncated: u64,
    /// Rejections by reason
    pub rejected: RejectCounters,
}

impl fmt::Display for ViewerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            concat!(
                "{} displayed, {} total, ",
                "skip: stripe={} dark={} size={} bright={} fragment={}, truncated={}"
            ),
            self.accepted,
            self.seen,
            self.rejected.stripe,
            self.rejected.dark,
            self.rejected.size,
            self.rejected.brightness,
            self.rejected.fragment,
            self.truncated
        )
    }
}

/// Frames-per-second over fixed windows
#[derive(Debug)]
struct FpsCounter {
    window_start: Instant,
    count: u32,
    fps: f32,
}

impl FpsCounter {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
            fps: 0.0,
        }
    }

    /// Count a frame; returns true when a window closed and `fps` changed.
    fn tick(&mut self, now: Instant, window: Duration) -> bool {
        self.count += 1;
        let elapsed = now.duration_since(self.window_start);
        if elapsed < window || elapsed.is_zero() {
            return false;
        }
        self.fps = self.count as f32 / elapsed.as_secs_f32();
        self.count = 0;
        self.window_start = now;
        true
    }
}

/// Viewer pipeline state
pub struct Viewer {
    config: ViewerConfig,
    width: usize,
    mode: DecodeMode,
    accumulator: Accumulator,
    filter: StabilityFilter,
    negotiated_frame_size: Option<u32>,
    save_next: bool,
    seen: u64,
    truncated: u64,
    last_signals: QualitySignals,
    fps: FpsCounter,
}

impl Viewer {
    /// Build the pipeline from a validated config.
    pub fn new(config: ViewerConfig, negotiated_frame_size: Option<u32>) -> Self {
        let target = negotiated_frame_size.unwrap_or(0) as usize;
        let mut accumulator = Accumulator::new(target, config.frame_capacity);
        accumulator.set_enabled(config.accumulate);

        Self {
            width: config.width.clamp(MIN_WIDTH, config.max_width.max(MIN_WIDTH)),
            mode: config.mode,
            filter: StabilityFilter::new(config.stability),
            accumulator,
            negotiated_frame_size,
            save_next: false,
            seen: 0,
            truncated: 0,
            last_signals: QualitySignals::default(),
            fps: FpsCounter::new(Instant::now()),
            config,
        }
    }

    /// Apply a control. Returns `false` for [`Control::Quit`].
    pub fn apply(&mut self, control: Control) -> bool {
        match control {
            Control::CycleMode => {
                self.mode = self.mode.next();
                log::info!("Mode -> {}", self.mode);
            }
            Control::Widen(step) => {
                self.width = (self.width + step).min(self.config.max_width);
                log::info!("Width -> {}", self.width);
            }
            Control::Narrow(step) => {
                self.width = self.width.saturating_sub(step).max(MIN_WIDTH);
                log::info!("Width -> {}", self.width);
            }
            Control::ResetWidth => {
                self.width = self.config.width;
                log::info!("Width -> {} (reset)", self.width);
            }
            Control::ToggleStripeFilter => {
                let enabled = !self.filter.stripe_filter_enabled();
                self.filter.set_stripe_filter(enabled);
                log::info!("Stripe filter {}", on_off(enabled));
            }
            Control::ToggleAccumulate => {
                let enabled = self.accumulator.toggle();
                log::info!(
                    "Accumulate {} (target={} bytes)",
                    on_off(enabled),
                    self.accumulator.target()
                );
                if enabled && !self.accumulator.is_active() {
                    log::warn!("No negotiated frame size, frames pass through unchanged");
                }
            }
            Control::ToggleHold => {
                let hold = !self.filter.hold_enabled();
                self.filter.set_hold(hold);
                log::info!(
                    "Hold {}",
                    if hold { "ON (stabilized)" } else { "OFF (show all)" }
                );
            }
            Control::ToggleLock => {
                self.filter.toggle_lock();
            }
            Control::LowerBrightness => {
                let threshold = self.filter.lower_dark_threshold();
                log::info!("Brightness threshold -> {}", threshold);
            }
            Control::SaveNext => {
                self.save_next = true;
                log::info!("Will save next displayed frame");
            }
            Control::Quit => return false,
        }
        true
    }

    /// Run an assembled frame through the pipeline, counting truncation.
    pub fn process_assembled(&mut self, frame: &AssembledFrame) -> FrameOutcome {
        if frame.truncated {
            self.truncated += 1;
            log::warn!("Frame truncated at {} bytes", frame.len());
        }
        self.process(&frame.data)
    }

    /// Run raw frame bytes through the pipeline.
    pub fn process(&mut self, frame: &[u8]) -> FrameOutcome {
        if frame.is_empty() {
            return FrameOutcome::Ignored;
        }
        if frame.len() < self.config.min_fragment_len {
            self.filter.record_rejection(RejectReason::Fragment);
            return FrameOutcome::Rejected(RejectReason::Fragment);
        }
        self.seen += 1;

        let (pixels, _) = strip_metadata_header(frame);
        let Some(pixels) = self.accumulator.feed(pixels) else {
            return FrameOutcome::Pending;
        };

        let verdict = self.filter.evaluate(&pixels);
        self.last_signals = *verdict.signals();
        if let Some(reason) = verdict.reason() {
            return FrameOutcome::Rejected(reason);
        }

        let accepted = self.filter.accepted_total();
        if accepted <= VERBOSE_FRAMES {
            log::info!(
                "Frame {}: {} bytes, mode={}, avg={}, nd={:.1}, first {}: {}",
                accepted,
                pixels.len(),
                self.mode,
                self.last_signals.mean_brightness,
                self.last_signals.neighbor_diff,
                PREVIEW_BYTES,
                hex_preview(&pixels, PREVIEW_BYTES)
            );
        }

        if self.save_next {
            self.save_next = false;
            match save_raw_frame(&self.config.output_dir, "ir_frame", &pixels) {
                Ok(path) => log::info!(
                    "Saved {} bytes -> {} (w={} mode={})",
                    pixels.len(),
                    path.display(),
                    self.width,
                    self.mode
                ),
                Err(e) => log::error!("Failed to save frame: {}", e),
            }
        }

        if self.fps.tick(Instant::now(), self.config.status_interval()) {
            log::info!("{}", self.status_line());
        }

        FrameOutcome::Displayed(RenderedFrame::from_frame(
            &pixels,
            self.width,
            self.config.height,
            self.mode,
        ))
    }

    /// Title-bar style status text.
    pub fn status_line(&self) -> String {
        let counters = self.filter.counters();
        format!(
            concat!(
                "IR w={} - {:.1} fps - #{} (of {}) - avg={} nd={:.0} - {} - {}B",
                " - skip: S={} D={} Z={} B={} F={}{}{}"
            ),
            self.width,
            self.fps.fps,
            self.filter.accepted_total(),
            self.seen,
            self.last_signals.mean_brightness,
            self.last_signals.neighbor_diff,
            self.mode,
            self.last_signals.len,
            counters.stripe,
            counters.dark,
            counters.size,
            counters.brightness,
            counters.fragment,
            if self.accumulator.is_enabled() { " [ACCUM]" } else { "" },
            if self.filter.hold_enabled() { " [HOLD]" } else { "" },
        )
    }

    /// Counters so far.
    pub fn summary(&self) -> ViewerSummary {
        ViewerSummary {
            seen: self.seen,
            accepted: self.filter.accepted_total(),
            truncated: self.truncated,
            rejected: *self.filter.counters(),
        }
    }

    /// Current display width.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Current decode mode.
    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    /// Stability filter state.
    pub fn filter(&self) -> &StabilityFilter {
        &self.filter
    }

    /// Accumulator state.
    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    /// Whether a save is pending.
    pub fn save_pending(&self) -> bool {
        self.save_next
    }

    /// Frame size learned from negotiation.
    pub fn negotiated_frame_size(&self) -> Option<u32> {
        self.negotiated_frame_size
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}

/// Run the control loop until quit, cancellation or end of stream.
///
/// Controls are drained before every read, so the reader should be built
/// with an idle limit to come back here while the device is silent. Sink
/// failures are logged and do not stop the loop.
///
/// # Errors
///
/// Returns the transport error if the source fails fatally.
pub fn run_loop<S: PacketSource>(
    reader: &mut FrameReader<S>,
    viewer: &mut Viewer,
    sink: &mut dyn FrameSink,
    controls: &Receiver<Control>,
    running: &RunFlag,
) -> Result<ViewerSummary, TransportError> {
    let mut controls_open = true;

    'outer: while running.is_running() {
        while controls_open {
            match controls.try_recv() {
                Ok(control) => {
                    if !viewer.apply(control) {
                        running.stop();
                        break 'outer;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => controls_open = false,
            }
        }

        let frame = reader.read_frame(running)?;
        if let FrameOutcome::Displayed(image) = viewer.process_assembled(&frame) {
            if let Err(e) = sink.present(&image) {
                log::warn!("Frame sink failed: {}", e);
            }
        }

        if frame.boundary == Boundary::Closed {
            log::info!("End of stream");
            break;
        }
    }

    let summary = viewer.summary();
    log::info!("Done: {}", summary);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_assembler::{FrameAssembler, ReadOptions};
    use crate::render::NullSink;
    use crate::test_utils::{
        interleaved_frame, metadata_prefixed, smooth_frame, PacketGenerator, ScriptedTransport,
    };
    use std::sync::mpsc;

    fn test_config() -> ViewerConfig {
        ViewerConfig {
            width: 100,
            height: 10,
            output_dir: std::env::temp_dir(),
            ..ViewerConfig::default()
        }
    }

    #[test]
    fn test_control_parse() {
        assert_eq!(Control::parse("m"), Some(Control::CycleMode));
        assert_eq!(Control::parse(" M \n"), Some(Control::CycleMode));
        assert_eq!(Control::parse("+"), Some(Control::Widen(1)));
        assert_eq!(Control::parse("++"), Some(Control::Widen(10)));
        assert_eq!(Control::parse("--"), Some(Control::Narrow(10)));
        assert_eq!(Control::parse("l"), Some(Control::ToggleLock));
        assert_eq!(Control::parse("q"), Some(Control::Quit));
        assert_eq!(Control::parse("x"), None);
        assert_eq!(Control::parse(""), None);
    }

    #[test]
    fn test_width_bounds() {
        let mut viewer = Viewer::new(test_config(), None);
        for _ in 0..20 {
            viewer.apply(Control::Narrow(10));
        }
        assert_eq!(viewer.width(), MIN_WIDTH);

        for _ in 0..200 {
            viewer.apply(Control::Widen(10));
        }
        assert_eq!(viewer.width(), 1284);

        viewer.apply(Control::ResetWidth);
        assert_eq!(viewer.width(), 100);
    }

    #[test]
    fn test_mode_cycles() {
        let mut viewer = Viewer::new(test_config(), None);
        viewer.apply(Control::CycleMode);
        assert_eq!(viewer.mode(), DecodeMode::DeinterleaveEven);
    }

    #[test]
    fn test_quit_control() {
        let mut viewer = Viewer::new(test_config(), None);
        assert!(!viewer.apply(Control::Quit));
    }

    #[test]
    fn test_fragment_gate() {
        let mut viewer = Viewer::new(test_config(), None);
        assert_eq!(viewer.process(&[]), FrameOutcome::Ignored);
        assert_eq!(
            viewer.process(&[80u8; 99]),
            FrameOutcome::Rejected(RejectReason::Fragment)
        );

        let summary = viewer.summary();
        assert_eq!(summary.seen, 0);
        assert_eq!(summary.rejected.fragment, 1);
    }

    #[test]
    fn test_accepted_frame_is_rendered() {
        let mut viewer = Viewer::new(test_config(), None);
        match viewer.process(&smooth_frame(1000, 80)) {
            FrameOutcome::Displayed(image) => {
                assert_eq!(image.width, 100);
                assert_eq!(image.height, 10);
                assert_eq!(image.pixels.len(), 1000);
            }
            other => panic!("expected display, got {:?}", other),
        }
        assert_eq!(viewer.summary().accepted, 1);
        assert_eq!(viewer.filter().locked_size(), Some(1000));
    }

    #[test]
    fn test_metadata_stripped_before_filter() {
        let mut viewer = Viewer::new(test_config(), None);
        let frame = metadata_prefixed(1, &smooth_frame(500, 80));
        assert!(matches!(viewer.process(&frame), FrameOutcome::Displayed(_)));
        assert_eq!(viewer.filter().locked_size(), Some(500));
    }

    #[test]
    fn test_interleaved_rejected_and_counted() {
        let mut viewer = Viewer::new(test_config(), None);
        assert_eq!(
            viewer.process(&interleaved_frame(256)),
            FrameOutcome::Rejected(RejectReason::Interleaved)
        );
        assert_eq!(viewer.summary().seen, 1);
        assert_eq!(viewer.summary().rejected.stripe, 1);
    }

    #[test]
    fn test_accumulation_stitches_fragments() {
        let mut config = test_config();
        config.accumulate = true;
        let mut viewer = Viewer::new(config, Some(600));

        assert_eq!(viewer.process(&smooth_frame(250, 80)), FrameOutcome::Pending);
        assert_eq!(viewer.process(&smooth_frame(250, 80)), FrameOutcome::Pending);
        assert!(matches!(
            viewer.process(&smooth_frame(250, 80)),
            FrameOutcome::Displayed(_)
        ));
        assert_eq!(viewer.filter().locked_size(), Some(600));
        assert_eq!(viewer.summary().seen, 3);
    }

    #[test]
    fn test_toggle_accumulate_resets_offset() {
        let mut viewer = Viewer::new(test_config(), Some(600));
        viewer.apply(Control::ToggleAccumulate);
        viewer.process(&smooth_frame(250, 80));
        assert_eq!(viewer.accumulator().pending(), 250);

        viewer.apply(Control::ToggleAccumulate);
        viewer.apply(Control::ToggleAccumulate);
        assert_eq!(viewer.accumulator().pending(), 0);
    }

    #[test]
    fn test_save_next_writes_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.output_dir = dir.path().to_path_buf();
        let mut viewer = Viewer::new(config, None);

        viewer.apply(Control::SaveNext);
        assert!(viewer.save_pending());
        viewer.process(&smooth_frame(400, 80));
        viewer.process(&smooth_frame(400, 80));
        assert!(!viewer.save_pending());

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_status_line() {
        let mut viewer = Viewer::new(test_config(), None);
        viewer.process(&smooth_frame(1000, 80));
        viewer.process(&interleaved_frame(1000));

        let status = viewer.status_line();
        assert!(status.contains("w=100"));
        assert!(status.contains("#1 (of 2)"));
        assert!(status.contains("raw-8bit"));
        assert!(status.contains("S=1 D=0 Z=0 B=0"));
        assert!(status.ends_with("[HOLD]"));
        assert!(!status.contains("[ACCUM]"));
    }

    #[test]
    fn test_run_loop_over_scripted_stream() {
        let mut gen = PacketGenerator::new(256);
        let mut transport = ScriptedTransport::new();
        for _ in 0..3 {
            transport = transport.packets(gen.packetize(&smooth_frame(1000, 80)));
        }
        transport = transport.packets(gen.packetize(&interleaved_frame(1000)));

        let mut reader =
            FrameReader::new(transport, FrameAssembler::default(), ReadOptions::default());
        let mut viewer = Viewer::new(test_config(), None);
        let (_tx, rx) = mpsc::channel();

        let summary =
            run_loop(&mut reader, &mut viewer, &mut NullSink, &rx, &RunFlag::new()).unwrap();
        assert_eq!(summary.accepted, 3);
        assert_eq!(summary.seen, 4);
        assert_eq!(summary.rejected.stripe, 1);
    }

    #[test]
    fn test_truncated_frame_counted_and_filtered() {
        let mut config = test_config();
        config.frame_capacity = 1000;

        // 300-byte packets: the fourth one overruns the 1000-byte buffer
        let mut gen = PacketGenerator::new(300);
        let transport = ScriptedTransport::new().packets(gen.packetize(&smooth_frame(1500, 80)));
        let mut reader = FrameReader::new(
            transport,
            FrameAssembler::new(config.frame_capacity),
            ReadOptions::default(),
        );
        let mut viewer = Viewer::new(config, None);
        let (_tx, rx) = mpsc::channel();

        let summary =
            run_loop(&mut reader, &mut viewer, &mut NullSink, &rx, &RunFlag::new()).unwrap();

        // The clipped 1000 bytes are shown and lock the band; the 300-byte
        // tail that follows falls outside it.
        assert_eq!(summary.truncated, 1);
        assert_eq!(summary.seen, 2);
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.rejected.size, 1);
        assert_eq!(viewer.filter().locked_size(), Some(1000));
    }

    #[test]
    fn test_process_assembled_counts_truncation() {
        let mut viewer = Viewer::new(test_config(), None);
        let frame = AssembledFrame {
            data: interleaved_frame(400),
            boundary: Boundary::Capacity,
            truncated: true,
        };

        assert_eq!(
            viewer.process_assembled(&frame),
            FrameOutcome::Rejected(RejectReason::Interleaved)
        );
        assert_eq!(viewer.summary().truncated, 1);
        assert_eq!(viewer.summary().rejected.stripe, 1);
    }

    #[test]
    fn test_run_loop_quits_on_control() {
        let transport = ScriptedTransport::new();
        let mut reader =
            FrameReader::new(transport, FrameAssembler::default(), ReadOptions::default());
        let mut viewer = Viewer::new(test_config(), None);
        let (tx, rx) = mpsc::channel();
        tx.send(Control::CycleMode).unwrap();
        tx.send(Control::Quit).unwrap();
        let running = RunFlag::new();

        run_loop(&mut reader, &mut viewer, &mut NullSink, &rx, &running).unwrap();
        assert!(!running.is_running());
        assert_eq!(viewer.mode(), DecodeMode::DeinterleaveEven);
    }

    #[test]
    fn test_run_loop_surfaces_fatal() {
        let transport = ScriptedTransport::new().fatal("gone");
        let mut reader =
            FrameReader::new(transport, FrameAssembler::default(), ReadOptions::default());
        let mut viewer = Viewer::new(test_config(), None);
        let (_tx, rx) = mpsc::channel();

        let result = run_loop(&mut reader, &mut viewer, &mut NullSink, &rx, &RunFlag::new());
        assert_eq!(result, Err(TransportError::Fatal("gone".to_string())));
    }
}
