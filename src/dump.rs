//! Diagnostic frame dump
//!
//! Captures a fixed number of assembled frames and describes each one: size,
//! metadata prefix, a hex preview and byte statistics. The first frame is
//! saved raw for offline inspection.

use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::capture::{save_raw_frame, CaptureError};
use crate::frame_assembler::{Boundary, FrameReader};
use crate::frame_validation::{neighbor_diff, ClassifierConfig, FrameStats};
use crate::metadata::strip_metadata_header;
use crate::transport::{PacketSource, RunFlag, TransportError};

/// Bytes shown per frame in the dump.
pub const DUMP_PREVIEW_BYTES: usize = 32;

/// Errors that abort a dump
#[derive(Debug, Error)]
pub enum DumpError {
    /// Reading from the source failed
    #[error("transport failed after {frames} frames: {source}")]
    Transport {
        /// Frames described before the failure
        frames: usize,
        /// Underlying error
        source: TransportError,
    },

    /// The first frame could not be saved
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Space-separated lowercase hex of the first `limit` bytes.
pub fn hex_preview(bytes: &[u8], limit: usize) -> String {
    let mut out = String::with_capacity(limit.min(bytes.len()) * 3);
    for (i, b) in bytes.iter().take(limit).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Description of one dumped frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DumpRecord {
    /// Position in the dump, from 0
    pub index: usize,
    /// Assembled length in bytes
    pub len: usize,
    /// Vendor metadata prefix present
    pub has_metadata: bool,
    /// Hex of the leading bytes after stripping
    pub preview: String,
    /// Whole-frame byte statistics, absent for fragments
    pub stats: Option<FrameStats>,
    /// Neighbour difference of the stripped bytes, absent for fragments
    pub neighbor_diff: Option<f64>,
    /// Neighbour difference above the stripe threshold
    pub interleaved: bool,
}

impl DumpRecord {
    /// Describe one assembled frame.
    pub fn describe(
        index: usize,
        frame: &[u8],
        classifier: &ClassifierConfig,
        min_fragment_len: usize,
    ) -> Self {
        let (pixels, has_metadata) = strip_metadata_header(frame);
        let full = frame.len() >= min_fragment_len;
        let nd = full.then(|| neighbor_diff(pixels, classifier.sample_window));

        Self {
            index,
            len: frame.len(),
            has_metadata,
            preview: hex_preview(pixels, DUMP_PREVIEW_BYTES),
            stats: if full { FrameStats::compute(frame) } else { None },
            neighbor_diff: nd,
            interleaved: nd.is_some_and(|nd| nd > classifier.stripe_threshold),
        }
    }
}

impl fmt::Display for DumpRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Frame {}: {} bytes{}",
            self.index,
            self.len,
            if self.has_metadata { " [meta]" } else { "" }
        )?;
        write!(f, "  {}", self.preview)?;
        if let (Some(stats), Some(nd)) = (self.stats, self.neighbor_diff) {
            write!(
                f,
                "\n  min={} max={} avg={:.1} nd={:.1} {}",
                stats.min,
                stats.max,
                stats.mean,
                nd,
                if self.interleaved { "INTERLEAVED" } else { "smooth" }
            )?;
        }
        Ok(())
    }
}

/// Result of a dump run
#[derive(Debug, Default)]
pub struct DumpReport {
    /// One record per non-empty frame
    pub records: Vec<DumpRecord>,
    /// Where the first frame was saved
    pub saved: Option<PathBuf>,
}

/// Capture up to `count` non-empty frames and describe them.
///
/// Stops early on cancellation or end of stream.
///
/// # Errors
///
/// Returns [`DumpError`] on a fatal transport error or if the first frame
/// cannot be saved.
pub fn run_dump<S: PacketSource>(
    reader: &mut FrameReader<S>,
    count: usize,
    classifier: &ClassifierConfig,
    min_fragment_len: usize,
    save_dir: Option<&Path>,
    running: &RunFlag,
) -> Result<DumpReport, DumpError> {
    let mut report = DumpReport::default();

    while report.records.len() < count && running.is_running() {
        let frame = reader
            .read_frame(running)
            .map_err(|source| DumpError::Transport {
                frames: report.records.len(),
                source,
            })?;

        if !frame.is_empty() {
            let record = DumpRecord::describe(
                report.records.len(),
                &frame.data,
                classifier,
                min_fragment_len,
            );
            log::debug!("{}", record);

            if record.index == 0 {
                if let Some(dir) = save_dir {
                    let path = save_raw_frame(dir, "ir_dump", &frame.data)?;
                    log::info!("Saved first frame -> {}", path.display());
                    report.saved = Some(path);
                }
            }
            report.records.push(record);
        }

        if matches!(frame.boundary, Boundary::Closed | Boundary::Cancelled) {
            break;
        }
    }

    Ok(report)
}
