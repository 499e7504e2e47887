//! Replay of recorded packet streams without hardware.
//!
//! A capture written by [`crate::capture`] is loaded into memory and served
//! through [`PacketSource`], so the same frame reader and pipeline that run
//! against the device can run against a file.
//!
//! # File Format
//!
//! ```text
//! [u32 LE: length][data bytes]...
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use ir_scope_lib::replay::FrameIterator;
//!
//! for frame in FrameIterator::new(Path::new("ir_raw_stream_12345.bin"))? {
//!     process_frame(&frame);
//! }
//! ```

use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::capture::{read_metadata, CaptureMetadata};
use crate::frame_assembler::{FrameAssembler, ProcessResult, DEFAULT_FRAME_CAPACITY};
use crate::transport::{PacketSource, TransportError};

/// Largest packet accepted from a capture file.
pub const MAX_REPLAY_PACKET: usize = DEFAULT_FRAME_CAPACITY;

/// Errors that can occur during packet replay operations.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// File not found or cannot be opened.
    #[error("failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    /// Invalid or corrupted packet data in the capture file.
    #[error("invalid packet data at offset {offset}: {message}")]
    InvalidPacket {
        /// Byte offset in the capture file where the error occurred.
        offset: u64,
        /// Description of the error.
        message: String,
    },
}

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Configuration for packet replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayConfig {
    /// Whether to loop the replay when reaching the end.
    pub loop_playback: bool,
}

/// Parse a capture file into packets.
///
/// # Errors
///
/// Returns `ReplayError::FileOpen` if the file cannot be read.
/// Returns `ReplayError::InvalidPacket` on a truncated record or an
/// implausible length.
pub fn read_capture_file(path: &Path) -> Result<Vec<Vec<u8>>> {
    let bytes = std::fs::read(path)?;
    parse_capture(&bytes)
}

/// Parse capture bytes into packets.
///
/// # Errors
///
/// Returns `ReplayError::InvalidPacket` on a truncated record or an
/// implausible length.
pub fn parse_capture(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut packets = Vec::new();
    let mut rest = bytes;
    let mut offset = 0u64;

    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(ReplayError::InvalidPacket {
                offset,
                message: "unexpected EOF reading packet length".to_string(),
            });
        }
        let (len_bytes, tail) = rest.split_at(4);
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;

        // Sanity check on length
        if len > MAX_REPLAY_PACKET {
            return Err(ReplayError::InvalidPacket {
                offset,
                message: format!("packet length {} exceeds 1MB limit", len),
            });
        }

        if tail.len() < len {
            return Err(ReplayError::InvalidPacket {
                offset,
                message: format!("unexpected EOF reading {} bytes of data", len),
            });
        }

        packets.push(tail[..len].to_vec());
        rest = &tail[len..];
        offset += 4 + len as u64;
    }

    Ok(packets)
}

/// Try to load metadata from a companion JSON file.
///
/// Looks for a file with the same base name but `.json` extension.
pub fn try_load_metadata(path: &Path) -> Option<CaptureMetadata> {
    let json_path = path.with_extension("json");
    if !json_path.exists() {
        return None;
    }
    match read_metadata(&json_path) {
        Ok(meta) => Some(meta),
        Err(e) => {
            log::warn!("Ignoring metadata {}: {}", json_path.display(), e);
            None
        }
    }
}

/// Packet source backed by a loaded capture.
pub struct ReplayTransport {
    /// Loaded packets ready for replay.
    packets: Vec<Vec<u8>>,
    /// Optional metadata from the capture session.
    metadata: Option<CaptureMetadata>,
    /// Replay configuration.
    config: ReplayConfig,
    /// Index of the next packet.
    position: usize,
    /// Completed passes over the packet list.
    loops: u64,
}

impl ReplayTransport {
    /// Load captured packets from a file.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::FileOpen` if the file cannot be opened.
    /// Returns `ReplayError::InvalidPacket` if the file contains corrupted data.
    pub fn load(path: &Path, config: ReplayConfig) -> Result<Self> {
        let packets = read_capture_file(path)?;
        let metadata = try_load_metadata(path);

        log::info!("Loaded {} packets from {}", packets.len(), path.display());
        if let Some(ref meta) = metadata {
            log::info!(
                "Metadata: {:04x}:{:04x}, negotiated {} bytes, {} packets, {} ms",
                meta.vendor_id,
                meta.product_id,
                meta.negotiated_frame_size,
                meta.total_packets,
                meta.duration_ms
            );
        }

        let mut replay = Self::from_packets(packets, config);
        replay.metadata = metadata;
        Ok(replay)
    }

    /// Serve an in-memory packet list.
    pub fn from_packets(packets: Vec<Vec<u8>>, config: ReplayConfig) -> Self {
        Self {
            packets,
            metadata: None,
            config,
            position: 0,
            loops: 0,
        }
    }

    /// Get the loaded metadata, if available.
    pub fn metadata(&self) -> Option<&CaptureMetadata> {
        self.metadata.as_ref()
    }

    /// Negotiated frame size recorded with the capture.
    pub fn negotiated_frame_size(&self) -> Option<u32> {
        self.metadata
            .as_ref()
            .map(|m| m.negotiated_frame_size)
            .filter(|&size| size > 0)
    }

    /// Get the number of loaded packets.
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Number of complete passes when looping.
    pub fn loops(&self) -> u64 {
        self.loops
    }
}

impl PacketSource for ReplayTransport {
    fn read_packet(
        &mut self,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> std::result::Result<usize, TransportError> {
        if self.position >= self.packets.len() {
            if !self.config.loop_playback || self.packets.is_empty() {
                return Err(TransportError::Closed);
            }
            self.position = 0;
            self.loops += 1;
            log::debug!("Replay looped ({} passes)", self.loops);
        }

        let packet = &self.packets[self.position];
        self.position += 1;

        if packet.len() > buf.len() {
            return Err(TransportError::Overflow);
        }
        buf[..packet.len()].copy_from_slice(packet);
        Ok(packet.len())
    }
}

/// Load and assemble all frames from a capture file.
///
/// Convenience function for tests and one-shot analysis. Frames cut off at
/// the end of the file are dropped.
///
/// # Errors
///
/// Returns an error if the file cannot be loaded.
pub fn replay_all_frames(path: &Path) -> Result<Vec<Vec<u8>>> {
    Ok(FrameIterator::new(path)?.collect())
}

/// Iterator over frames in a capture file.
pub struct FrameIterator {
    packets: std::vec::IntoIter<Vec<u8>>,
    assembler: FrameAssembler,
}

impl FrameIterator {
    /// Create a frame iterator from a capture file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded.
    pub fn new(path: &Path) -> Result<Self> {
        Ok(Self::from_packets(read_capture_file(path)?))
    }

    /// Iterate frames of an in-memory packet list.
    pub fn from_packets(packets: Vec<Vec<u8>>) -> Self {
        Self {
            packets: packets.into_iter(),
            assembler: FrameAssembler::default(),
        }
    }
}

impl Iterator for FrameIterator {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(frame) = self.assembler.take_queued() {
            return Some(frame.data);
        }

        for packet in self.packets.by_ref() {
            if let ProcessResult::Frame(frame) = self.assembler.process_packet(&packet) {
                return Some(frame.data);
            }
        }
        None
    }
}
