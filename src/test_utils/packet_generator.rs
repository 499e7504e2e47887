//! Synthetic packet generation for testing
//!
//! Builds bulk packets with the camera's two-byte micro-header and frame
//! payloads with known quality signals, so the pipeline can be exercised
//! without the device.
//!
//! # Example
//!
//! ```rust,ignore
//! use ir_scope_lib::test_utils::{smooth_frame, PacketGenerator};
//!
//! let mut gen = PacketGenerator::default();
//!
//! // One frame split into bulk packets, EOF on the last one
//! let packets = gen.packetize(&smooth_frame(60000, 80));
//!
//! // Same frame delimited only by the frame-ID toggle
//! let packets = gen.packetize_without_eof(&smooth_frame(60000, 80));
//! ```

use crate::frame_assembler::{BFH_EOF, BFH_ERR, BFH_FID};
use crate::metadata::METADATA_MARKER;

/// Micro-header builder
#[derive(Debug, Clone)]
pub struct PacketHeader {
    /// Header length, at least 2; bytes past the flags are zero padding
    pub length: u8,
    /// Frame ID (FID) bit - toggles each frame
    pub fid: bool,
    /// End of Frame (EOF) bit
    pub eof: bool,
    /// Error bit
    pub error: bool,
}

impl PacketHeader {
    /// Create a minimal 2-byte header
    pub fn minimal(fid: bool, eof: bool) -> Self {
        Self {
            length: 2,
            fid,
            eof,
            error: false,
        }
    }

    /// Create a header that only carries the error flag
    pub fn error() -> Self {
        Self {
            length: 2,
            fid: false,
            eof: false,
            error: true,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.fid {
            flags |= BFH_FID;
        }
        if self.eof {
            flags |= BFH_EOF;
        }
        if self.error {
            flags |= BFH_ERR;
        }

        let mut bytes = vec![0u8; usize::from(self.length.max(2))];
        bytes[0] = self.length;
        bytes[1] = flags;
        bytes
    }
}

/// Build a packet with a 2-byte header carrying `flags`.
pub fn uvc_packet(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + 2);
    packet.push(2);
    packet.push(flags);
    packet.extend_from_slice(payload);
    packet
}

/// Generates synthetic bulk packets for testing
pub struct PacketGenerator {
    /// Maximum payload size per packet (excluding header)
    pub max_payload_size: usize,
    /// Current frame ID (toggles each frame)
    current_fid: bool,
}

impl Default for PacketGenerator {
    fn default() -> Self {
        Self::new(16 * 1024)
    }
}

impl PacketGenerator {
    /// Create a new packet generator with specified max payload size
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            max_payload_size: max_payload_size.max(1),
            current_fid: false,
        }
    }

    /// Split a frame into packets, EOF set on the last one
    pub fn packetize(&mut self, frame_data: &[u8]) -> Vec<Vec<u8>> {
        self.packetize_frame(frame_data, true)
    }

    /// Split a frame into packets without EOF; only the FID toggle marks it
    pub fn packetize_without_eof(&mut self, frame_data: &[u8]) -> Vec<Vec<u8>> {
        self.packetize_frame(frame_data, false)
    }

    fn packetize_frame(&mut self, frame_data: &[u8], mark_eof: bool) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        let mut offset = 0;

        // Toggle FID for new frame
        self.current_fid = !self.current_fid;

        while offset < frame_data.len() {
            let remaining = frame_data.len() - offset;
            let payload_size = remaining.min(self.max_payload_size);
            let is_last = offset + payload_size >= frame_data.len();

            let mut packet =
                PacketHeader::minimal(self.current_fid, mark_eof && is_last).to_bytes();
            packet.extend_from_slice(&frame_data[offset..offset + payload_size]);

            packets.push(packet);
            offset += payload_size;
        }

        packets
    }
}

/// Gently varying frame: neighbour diff well under 1, mean near `base + 3`.
pub fn smooth_frame(len: usize, base: u8) -> Vec<u8> {
    (0..len)
        .map(|i| base.saturating_add(((i / 16) % 8) as u8))
        .collect()
}

/// Alternating 0x10/0xF0 bytes, the classic interleave artifact.
pub fn interleaved_frame(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| if i % 2 == 0 { 0x10 } else { 0xF0 })
        .collect()
}

/// Nearly black frame with a little texture.
pub fn dark_frame(len: usize) -> Vec<u8> {
    (0..len).map(|i| 4 + (i % 3) as u8).collect()
}

/// Prefix `payload` with the vendor metadata block.
pub fn metadata_prefixed(sequence: u8, payload: &[u8]) -> Vec<u8> {
    let size = (payload.len().min(usize::from(u16::MAX)) as u16).to_le_bytes();
    let mut frame = vec![
        sequence,
        0x00,
        METADATA_MARKER[0],
        METADATA_MARKER[1],
        0x00,
        0x00,
        size[0],
        size[1],
        0x00,
        0x00,
    ];
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_to_bytes() {
        assert_eq!(PacketHeader::minimal(true, true).to_bytes(), vec![2, 0x03]);
        assert_eq!(PacketHeader::error().to_bytes(), vec![2, 0x40]);

        let padded = PacketHeader {
            length: 6,
            ..PacketHeader::minimal(false, false)
        };
        assert_eq!(padded.to_bytes(), vec![6, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_packetize_marks_last_packet() {
        let mut gen = PacketGenerator::new(100);
        let packets = gen.packetize(&[7u8; 250]);

        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0][1], BFH_FID);
        assert_eq!(packets[1][1], BFH_FID);
        assert_eq!(packets[2][1], BFH_FID | BFH_EOF);
        assert_eq!(packets[2].len(), 52);
    }

    #[test]
    fn test_fid_toggles_between_frames() {
        let mut gen = PacketGenerator::new(100);
        let first = gen.packetize_without_eof(&[1u8; 10]);
        let second = gen.packetize_without_eof(&[1u8; 10]);
        assert_eq!(first[0][1] & BFH_FID, BFH_FID);
        assert_eq!(second[0][1] & BFH_FID, 0);
        assert_eq!(second[0][1] & BFH_EOF, 0);
    }

    #[test]
    fn test_metadata_prefixed_layout() {
        let frame = metadata_prefixed(3, &[0xAA; 20]);
        assert_eq!(&frame[..8], &[3, 0, 0xE8, 0x03, 0, 0, 20, 0]);
        assert_eq!(frame.len(), 30);
    }
}
