//! Raw packet stream recording for offline analysis and replay.
//!
//! Packets are written exactly as the bulk endpoint delivered them, before
//! any header parsing, so a recording can be fed back through the whole
//! pipeline later (see [`crate::replay`]).
//!
//! # File Format
//!
//! - `ir_raw_stream_<ts>.bin`: sequence of `[u32 LE: length][bytes: data]...`
//! - `ir_raw_stream_<ts>.json`: device and capture information
//!
//! # Example
//!
//! ```ignore
//! let result = record_to_dir(
//!     &mut transport,
//!     Path::new("/tmp"),
//!     CaptureMetadata::for_device(negotiated),
//!     &RecordOptions::default(),
//!     &running,
//! )?;
//! println!("saved {}", result.packets_path.display());
//! ```

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::transport::{
    PacketSource, RunFlag, TransportError, DEFAULT_READ_TIMEOUT, MAX_PACKET_SIZE,
};
use crate::usb::{PRODUCT_ID, VENDOR_ID};

/// Default byte budget for a raw recording.
pub const DEFAULT_RECORD_LIMIT: usize = 2 * 1024 * 1024;

/// Bytes of framing added per packet.
pub const PACKET_PREFIX_LEN: usize = 4;

/// Errors that can occur during packet capture operations.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Output directory does not exist.
    #[error("output directory does not exist: {0}")]
    DirectoryNotFound(String),

    /// The transport failed while recording. Data up to that point is saved.
    #[error("transport failed after {packets} packets: {source}")]
    Transport {
        /// Packets saved before the failure.
        packets: u64,
        /// Underlying failure.
        source: TransportError,
    },
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Metadata about the capture session and device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// USB vendor ID of the device.
    pub vendor_id: u16,
    /// USB product ID of the device.
    pub product_id: u16,
    /// Frame size from probe/commit, 0 when negotiation failed.
    #[serde(default)]
    pub negotiated_frame_size: u32,
    /// Total number of packets captured.
    #[serde(default)]
    pub total_packets: u64,
    /// Capture duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Total bytes captured, including length prefixes.
    #[serde(default)]
    pub total_bytes: u64,
    /// Optional description or notes about the capture.
    #[serde(default)]
    pub description: String,
}

impl CaptureMetadata {
    /// Metadata for the supported camera.
    pub fn for_device(negotiated_frame_size: Option<u32>) -> Self {
        Self {
            vendor_id: VENDOR_ID,
            product_id: PRODUCT_ID,
            negotiated_frame_size: negotiated_frame_size.unwrap_or(0),
            ..Self::default()
        }
    }
}

/// Result returned when a recording completes.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    /// Path to the saved packet stream.
    pub packets_path: PathBuf,
    /// Path to the saved metadata sidecar.
    pub metadata_path: PathBuf,
    /// Summary of the capture session.
    pub metadata: CaptureMetadata,
}

/// Knobs for [`record_stream`].
#[derive(Debug, Clone, Copy)]
pub struct RecordOptions {
    /// Stop once this many bytes (prefixes included) are written.
    pub limit: usize,
    /// Per-packet read timeout.
    pub timeout: Duration,
    /// Read buffer size.
    pub packet_size: usize,
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_RECORD_LIMIT,
            timeout: DEFAULT_READ_TIMEOUT,
            packet_size: MAX_PACKET_SIZE,
        }
    }
}

/// Writes packets in the length-prefixed capture format.
pub struct PacketRecorder<W: Write> {
    writer: W,
    packets: u64,
    bytes: u64,
}

impl<W: Write> PacketRecorder<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            packets: 0,
            bytes: 0,
        }
    }

    /// Append one packet.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Io` if the write fails.
    pub fn record(&mut self, packet: &[u8]) -> Result<()> {
        let len = u32::try_from(packet.len()).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "packet longer than u32::MAX",
            )
        })?;
        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(packet)?;
        self.packets += 1;
        self.bytes += (PACKET_PREFIX_LEN + packet.len()) as u64;
        Ok(())
    }

    /// Packets written so far.
    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Bytes written so far, including length prefixes.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Flush and return the writer.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Io` if the flush fails.
    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Copy packets from `source` into `recorder` until the byte budget is spent,
/// the source closes, or `running` is cleared.
///
/// Timeouts, overflows and zero-length reads are skipped.
///
/// # Errors
///
/// Returns `CaptureError::Transport` on a fatal read error and
/// `CaptureError::Io` if writing fails.
pub fn record_stream<S, W>(
    source: &mut S,
    recorder: &mut PacketRecorder<W>,
    options: &RecordOptions,
    running: &RunFlag,
) -> Result<()>
where
    S: PacketSource + ?Sized,
    W: Write,
{
    let mut packet = vec![0u8; options.packet_size.max(1)];

    while running.is_running() && recorder.bytes() < options.limit as u64 {
        let len = match source.read_packet(&mut packet, options.timeout) {
            Ok(len) => len,
            Err(e) if e.is_transient() => continue,
            Err(TransportError::Closed) => break,
            Err(source) => {
                log::error!("Raw dump stopped by transport error: {}", source);
                return Err(CaptureError::Transport {
                    packets: recorder.packets(),
                    source,
                });
            }
        };
        if len == 0 {
            continue;
        }

        recorder.record(&packet[..len.min(packet.len())])?;
        log::debug!(
            "Raw dump: {} bytes ({} packets)",
            recorder.bytes(),
            recorder.packets()
        );
    }

    Ok(())
}

/// Record a raw stream into `output_dir`, writing the packet file and a JSON
/// sidecar with the same stem.
///
/// A transport failure still saves everything captured before it, then
/// surfaces the error.
///
/// # Errors
///
/// Returns `CaptureError::DirectoryNotFound` if the output directory doesn't exist.
/// Returns `CaptureError::Io` or `CaptureError::Json` if saving fails.
/// Returns `CaptureError::Transport` if the source failed mid-recording.
pub fn record_to_dir<S>(
    source: &mut S,
    output_dir: &Path,
    mut metadata: CaptureMetadata,
    options: &RecordOptions,
    running: &RunFlag,
) -> Result<CaptureResult>
where
    S: PacketSource + ?Sized,
{
    if !output_dir.exists() {
        return Err(CaptureError::DirectoryNotFound(
            output_dir.display().to_string(),
        ));
    }

    let timestamp = unix_timestamp();
    let packets_path = output_dir.join(format!("ir_raw_stream_{}.bin", timestamp));
    let metadata_path = packets_path.with_extension("json");

    log::info!(
        "Saving raw packet stream to {} (up to {} bytes)",
        packets_path.display(),
        options.limit
    );

    let start = Instant::now();
    let mut recorder = PacketRecorder::new(BufWriter::new(File::create(&packets_path)?));
    let outcome = record_stream(source, &mut recorder, options, running);

    metadata.total_packets = recorder.packets();
    metadata.total_bytes = recorder.bytes();
    metadata.duration_ms = start.elapsed().as_millis() as u64;
    recorder.finish()?;
    write_metadata(&metadata_path, &metadata)?;

    log::info!(
        "Saved {} bytes ({} packets) to {}",
        metadata.total_bytes,
        metadata.total_packets,
        packets_path.display()
    );

    outcome?;
    Ok(CaptureResult {
        packets_path,
        metadata_path,
        metadata,
    })
}

/// Writes capture metadata as pretty JSON.
///
/// # Errors
///
/// Returns `CaptureError::Io` or `CaptureError::Json`.
pub fn write_metadata(path: &Path, metadata: &CaptureMetadata) -> Result<()> {
    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(path, json)?;
    log::debug!("Saved metadata to {}", path.display());
    Ok(())
}

/// Reads capture metadata from a JSON file.
///
/// # Arguments
///
/// * `path` - Path to the metadata sidecar.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read.
/// Returns `CaptureError::Json` if the JSON is invalid.
pub fn read_metadata(path: &Path) -> Result<CaptureMetadata> {
    let json = std::fs::read_to_string(path)?;
    let metadata: CaptureMetadata = serde_json::from_str(&json)?;
    Ok(metadata)
}

/// Write `bytes` to `dir/<prefix>_<unix>_<len>.raw`, returning the path.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be written.
pub fn save_raw_frame(dir: &Path, prefix: &str, bytes: &[u8]) -> Result<PathBuf> {
    let path = dir.join(format!("{}_{}_{}.raw", prefix, unix_timestamp(), bytes.len()));
    std::fs::write(&path, bytes)?;
    Ok(path)
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
