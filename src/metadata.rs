//! Vendor metadata prefix detection
//!
//! Some assembled frames start with a 10-byte block the camera inserts ahead
//! of the pixel data:
//!
//! ```text
//! [seq][00][e8 03][00 00][size lo][size hi][00 00]
//! ```
//!
//! Only bytes 1..4 are used for detection. The remaining fields are exposed
//! for diagnostics.

/// Length of the metadata block.
pub const METADATA_HEADER_LEN: usize = 10;

/// Marker found at offsets 2..4 of the block.
pub const METADATA_MARKER: [u8; 2] = [0xE8, 0x03];

/// Fields decoded from a metadata block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataHeader {
    /// Rolling sequence byte.
    pub sequence: u8,
    /// Payload size announced by the device, little-endian at offset 6.
    pub payload_size: u16,
}

/// Whether `frame` starts with a metadata block.
///
/// The frame must be strictly longer than 12 bytes so that pixel data remains
/// after stripping.
pub fn has_metadata_header(frame: &[u8]) -> bool {
    frame.len() > 12 && frame[1] == 0x00 && frame[2..4] == METADATA_MARKER
}

/// Decode the metadata block if present.
pub fn parse_metadata_header(frame: &[u8]) -> Option<MetadataHeader> {
    if !has_metadata_header(frame) {
        return None;
    }
    Some(MetadataHeader {
        sequence: frame[0],
        payload_size: u16::from_le_bytes([frame[6], frame[7]]),
    })
}

/// Remove the metadata block, returning the remaining bytes and whether a
/// block was found. Frames without one are returned unchanged.
pub fn strip_metadata_header(frame: &[u8]) -> (&[u8], bool) {
    if has_metadata_header(frame) {
        (&frame[METADATA_HEADER_LEN..], true)
    } else {
        (frame, false)
    }
}
