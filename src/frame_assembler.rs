//! Frame assembly from UVC bulk payloads
//!
//! Every bulk packet carries a two-byte micro-header (length, flags) followed
//! by payload. Payload bytes are concatenated into a bounded frame buffer
//! until one of two boundary detectors fires:
//!
//! - the explicit end-of-frame flag (`0x02`), or
//! - a toggle of the frame-identity bit (`0x01`) while data is buffered.
//!
//! Packets whose header is not plausible are copied verbatim, and the error
//! flag (`0x40`) discards the frame in progress.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ir_scope_lib::frame_assembler::{FrameAssembler, ProcessResult};
//!
//! let mut assembler = FrameAssembler::default();
//!
//! for packet in usb_packets {
//!     if let ProcessResult::Frame(frame) = assembler.process_packet(&packet) {
//!         handle(frame);
//!     }
//! }
//! ```

use std::time::Duration;

use crate::transport::{
    PacketSource, RunFlag, TransportError, DEFAULT_READ_TIMEOUT, MAX_PACKET_SIZE,
};

/// Upper bound on a single assembled frame.
pub const DEFAULT_FRAME_CAPACITY: usize = 1024 * 1024;

/// Frame-identity bit, alternates between frames.
pub const BFH_FID: u8 = 0x01;
/// End-of-frame bit.
pub const BFH_EOF: u8 = 0x02;
/// Device-side error bit.
pub const BFH_ERR: u8 = 0x40;

/// Why an assembled frame was handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Packet carried the end-of-frame flag.
    EndOfFrame,
    /// Frame-identity bit changed while data was buffered.
    FrameIdToggle,
    /// Frame buffer reached its capacity.
    Capacity,
    /// The run flag was cleared mid-frame.
    Cancelled,
    /// Too many consecutive read timeouts. Carries no data; the partial
    /// frame stays buffered for the next read.
    Idle,
    /// The transport has no more packets.
    Closed,
}

/// A frame handed out by the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFrame {
    /// Payload bytes with all micro-headers removed.
    pub data: Vec<u8>,
    /// Which detector ended the frame.
    pub boundary: Boundary,
    /// Whether payload bytes were dropped at the capacity limit.
    pub truncated: bool,
}

impl AssembledFrame {
    /// Frame length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no payload was collected (pure noise or cancellation).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Result of processing a single packet
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessResult {
    /// No complete frame yet, continue accumulating
    Accumulating,
    /// Complete frame ready
    Frame(AssembledFrame),
    /// Packet was discarded (empty or error flag)
    Skipped,
}

/// Parsed micro-header of a bulk packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UvcHeader {
    /// Header length in bytes, payload starts here.
    pub length: usize,
    /// Raw flag byte.
    pub flags: u8,
}

impl UvcHeader {
    /// Frame-identity bit.
    pub fn frame_id(&self) -> bool {
        self.flags & BFH_FID != 0
    }

    /// End-of-frame bit.
    pub fn end_of_frame(&self) -> bool {
        self.flags & BFH_EOF != 0
    }

    /// Device error bit.
    pub fn error(&self) -> bool {
        self.flags & BFH_ERR != 0
    }
}

/// Parse the micro-header, or `None` when the packet must be treated as raw data.
///
/// A header is accepted when its declared length is at least 2 and does not
/// exceed the packet. Unlike strict UVC parsing the end-of-header bit is not
/// required; this device does not reliably set it.
#[inline]
pub fn parse_uvc_header(packet: &[u8]) -> Option<UvcHeader> {
    if packet.len() < 2 {
        return None;
    }

    let length = packet[0] as usize;
    if length < 2 || length > packet.len() {
        return None;
    }

    Some(UvcHeader {
        length,
        flags: packet[1],
    })
}

/// Assembles frames from bulk payload packets
#[derive(Debug)]
pub struct FrameAssembler {
    /// Buffer to accumulate frame data across packets
    frame_buffer: Vec<u8>,
    /// Hard limit on `frame_buffer` length
    capacity: usize,
    /// Last seen frame ID (FID bit), `None` until established
    last_frame_id: Option<bool>,
    /// Bytes were clipped from the frame in progress
    truncated: bool,
    /// Second frame completed by the same packet as the previous one
    queued: Option<AssembledFrame>,
    /// Number of handed-out frames that lost bytes to the capacity limit
    truncated_frames: u64,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_CAPACITY)
    }
}

impl FrameAssembler {
    /// Create an assembler whose frames never exceed `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            frame_buffer: Vec::with_capacity(capacity.min(DEFAULT_FRAME_CAPACITY)),
            capacity,
            last_frame_id: None,
            truncated: false,
            queued: None,
            truncated_frames: 0,
        }
    }

    /// Reset the assembler state
    pub fn reset(&mut self) {
        self.frame_buffer.clear();
        self.last_frame_id = None;
        self.truncated = false;
        self.queued = None;
    }

    /// Current buffer size
    pub fn buffer_len(&self) -> usize {
        self.frame_buffer.len()
    }

    /// Maximum frame size
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the frame in progress has hit the capacity limit.
    pub fn is_full(&self) -> bool {
        self.frame_buffer.len() >= self.capacity
    }

    /// Frame-identity bit of the frame in progress, if established.
    pub fn frame_id(&self) -> Option<bool> {
        self.last_frame_id
    }

    /// Frames handed out with bytes clipped at capacity.
    pub fn truncated_frames(&self) -> u64 {
        self.truncated_frames
    }

    /// Take a frame that completed together with the previously returned one.
    pub fn take_queued(&mut self) -> Option<AssembledFrame> {
        self.queued.take()
    }

    /// Hand out whatever is buffered, possibly nothing.
    ///
    /// Identity tracking is kept so a following packet of the same frame is
    /// not mistaken for a boundary.
    pub fn flush(&mut self, boundary: Boundary) -> AssembledFrame {
        let truncated = std::mem::take(&mut self.truncated);
        if truncated {
            self.truncated_frames += 1;
        }
        AssembledFrame {
            data: std::mem::take(&mut self.frame_buffer),
            boundary,
            truncated,
        }
    }

    /// Process a single bulk packet
    ///
    /// Returns `ProcessResult::Frame(frame)` when a boundary is detected. If
    /// the same packet both toggles the frame ID and carries end-of-frame,
    /// the earlier frame is returned and the later one is parked for
    /// [`FrameAssembler::take_queued`].
    pub fn process_packet(&mut self, packet: &[u8]) -> ProcessResult {
        if packet.is_empty() {
            return ProcessResult::Skipped;
        }

        let Some(header) = parse_uvc_header(packet) else {
            // Not a plausible header: keep the whole packet as payload
            self.append(packet);
            return ProcessResult::Accumulating;
        };

        if header.error() {
            log::debug!(
                "Error flag set, discarding {} buffered bytes",
                self.frame_buffer.len()
            );
            self.frame_buffer.clear();
            self.truncated = false;
            self.last_frame_id = None;
            return ProcessResult::Skipped;
        }

        // Implicit boundary: the packet already belongs to the next frame
        let frame_id = header.frame_id();
        let previous = match self.last_frame_id {
            Some(last) if last != frame_id && !self.frame_buffer.is_empty() => {
                log::debug!(
                    "FID toggle frame boundary: {} bytes",
                    self.frame_buffer.len()
                );
                Some(self.flush(Boundary::FrameIdToggle))
            }
            _ => None,
        };
        self.last_frame_id = Some(frame_id);

        self.append(&packet[header.length..]);

        let current = if header.end_of_frame() && !self.frame_buffer.is_empty() {
            log::debug!("EOF frame boundary: {} bytes", self.frame_buffer.len());
            Some(self.flush(Boundary::EndOfFrame))
        } else {
            None
        };

        match (previous, current) {
            (Some(previous), Some(current)) => {
                self.queued = Some(current);
                ProcessResult::Frame(previous)
            }
            (Some(frame), None) | (None, Some(frame)) => ProcessResult::Frame(frame),
            (None, None) => ProcessResult::Accumulating,
        }
    }

    /// Append payload, clipped to the remaining capacity
    fn append(&mut self, payload: &[u8]) {
        let room = self.capacity.saturating_sub(self.frame_buffer.len());
        let take = payload.len().min(room);
        if take < payload.len() {
            self.truncated = true;
        }
        self.frame_buffer.extend_from_slice(&payload[..take]);
    }
}

/// Timing knobs for [`FrameReader::read_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Per-packet read timeout.
    pub timeout: Duration,
    /// Give up on the frame after this many consecutive timeouts (`None` = never).
    pub max_idle_reads: Option<u32>,
    /// Size of the packet read buffer.
    pub packet_size: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_READ_TIMEOUT,
            max_idle_reads: None,
            packet_size: MAX_PACKET_SIZE,
        }
    }
}

/// Pulls packets from a [`PacketSource`] until a frame is complete.
pub struct FrameReader<S> {
    source: S,
    assembler: FrameAssembler,
    packet: Vec<u8>,
    options: ReadOptions,
}

impl<S: PacketSource> FrameReader<S> {
    /// Wrap a packet source.
    pub fn new(source: S, assembler: FrameAssembler, options: ReadOptions) -> Self {
        Self {
            source,
            assembler,
            packet: vec![0u8; options.packet_size.max(2)],
            options,
        }
    }

    /// The assembler driven by this reader.
    pub fn assembler(&self) -> &FrameAssembler {
        &self.assembler
    }

    /// Read packets until a frame boundary, capacity, cancellation or idle limit.
    ///
    /// The returned frame may be empty when nothing was buffered. Hitting the
    /// idle limit returns an empty [`Boundary::Idle`] frame and keeps any
    /// partial data for the next call. Timeouts and overflows are retried here
    /// and never surface.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the source fails fatally.
    pub fn read_frame(&mut self, running: &RunFlag) -> Result<AssembledFrame, TransportError> {
        if let Some(frame) = self.assembler.take_queued() {
            return Ok(frame);
        }

        let mut idle_reads = 0u32;
        while running.is_running() {
            if self.assembler.is_full() {
                log::debug!("Frame buffer full at {} bytes", self.assembler.capacity());
                return Ok(self.assembler.flush(Boundary::Capacity));
            }

            let len = match self.source.read_packet(&mut self.packet, self.options.timeout) {
                Ok(len) => len,
                Err(TransportError::Timeout) => {
                    idle_reads += 1;
                    if self
                        .options
                        .max_idle_reads
                        .is_some_and(|limit| idle_reads >= limit)
                    {
                        return Ok(AssembledFrame {
                            data: Vec::new(),
                            boundary: Boundary::Idle,
                            truncated: false,
                        });
                    }
                    continue;
                }
                Err(TransportError::Overflow) => {
                    log::debug!("Bulk read overflow, retrying");
                    continue;
                }
                Err(TransportError::Closed) => {
                    return Ok(self.assembler.flush(Boundary::Closed));
                }
                Err(err @ TransportError::Fatal(_)) => return Err(err),
            };
            idle_reads = 0;

            let len = len.min(self.packet.len());
            if let ProcessResult::Frame(frame) = self.assembler.process_packet(&self.packet[..len])
            {
                return Ok(frame);
            }
        }

        Ok(self.assembler.flush(Boundary::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{uvc_packet, ScriptedTransport};

    // =========================================================================
    // Header Parsing Tests
    // =========================================================================

    #[test]
    fn test_2_byte_header_minimal() {
        let data = [0x02, 0x00, 0xAB, 0xCD];
        let header = parse_uvc_header(&data).unwrap();
        assert_eq!(header.length, 2);
        assert!(!header.frame_id());
        assert!(!header.end_of_frame());
    }

    #[test]
    fn test_header_flags() {
        let data = [0x02, 0x43, 0xAB];
        let header = parse_uvc_header(&data).unwrap();
        assert!(header.frame_id());
        assert!(header.end_of_frame());
        assert!(header.error());
    }

    #[test]
    fn test_12_byte_header() {
        let data = [
            0x0C, 0x8C, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB,
        ];
        assert_eq!(parse_uvc_header(&data).map(|h| h.length), Some(12));
    }

    #[test]
    fn test_header_exactly_packet_length() {
        let data = [0x04, 0x00, 0x11, 0x22];
        assert_eq!(parse_uvc_header(&data).map(|h| h.length), Some(4));
    }

    #[test]
    fn test_reject_header_len_too_small() {
        assert_eq!(parse_uvc_header(&[0x00, 0x00, 0xAB]), None);
        assert_eq!(parse_uvc_header(&[0x01, 0x00, 0xAB]), None);
    }

    #[test]
    fn test_reject_header_exceeds_packet() {
        let data = [0x0C, 0x8C, 0x11, 0x22, 0x33, 0x44];
        assert_eq!(parse_uvc_header(&data), None);
    }

    #[test]
    fn test_reject_too_short_data() {
        assert_eq!(parse_uvc_header(&[0x02]), None);
        assert_eq!(parse_uvc_header(&[]), None);
    }

    // =========================================================================
    // FrameAssembler Tests
    // =========================================================================

    #[test]
    fn test_assembler_creation() {
        let assembler = FrameAssembler::default();
        assert_eq!(assembler.buffer_len(), 0);
        assert_eq!(assembler.capacity(), DEFAULT_FRAME_CAPACITY);
        assert_eq!(assembler.frame_id(), None);
    }

    #[test]
    fn test_empty_packet_skipped() {
        let mut assembler = FrameAssembler::default();
        assert_eq!(assembler.process_packet(&[]), ProcessResult::Skipped);
    }

    #[test]
    fn test_eof_completes_frame() {
        let mut assembler = FrameAssembler::default();

        let first = uvc_packet(0x00, &[0x11; 64]);
        let last = uvc_packet(BFH_EOF, &[0x22; 64]);

        assert_eq!(assembler.process_packet(&first), ProcessResult::Accumulating);
        match assembler.process_packet(&last) {
            ProcessResult::Frame(frame) => {
                assert_eq!(frame.len(), 128);
                assert_eq!(frame.boundary, Boundary::EndOfFrame);
                assert!(!frame.truncated);
                assert_eq!(frame.data[0], 0x11);
                assert_eq!(frame.data[127], 0x22);
            }
            other => panic!("expected frame, got {:?}", other),
        }
        assert_eq!(assembler.buffer_len(), 0);
    }

    #[test]
    fn test_fid_toggle_completes_previous_frame() {
        let mut assembler = FrameAssembler::default();

        assembler.process_packet(&uvc_packet(0x00, &[1; 10]));
        assembler.process_packet(&uvc_packet(0x00, &[2; 10]));

        match assembler.process_packet(&uvc_packet(BFH_FID, &[3; 10])) {
            ProcessResult::Frame(frame) => {
                assert_eq!(frame.len(), 20);
                assert_eq!(frame.boundary, Boundary::FrameIdToggle);
                assert!(frame.data.iter().all(|&b| b != 3));
            }
            other => panic!("expected frame, got {:?}", other),
        }

        // Toggle packet's payload starts the next frame
        assert_eq!(assembler.buffer_len(), 10);
        assert_eq!(assembler.frame_id(), Some(true));
    }

    #[test]
    fn test_fid_toggle_with_empty_buffer_is_not_boundary() {
        let mut assembler = FrameAssembler::default();
        assembler.process_packet(&uvc_packet(0x00, &[]));
        assert_eq!(
            assembler.process_packet(&uvc_packet(BFH_FID, &[7; 4])),
            ProcessResult::Accumulating
        );
        assert_eq!(assembler.buffer_len(), 4);
    }

    #[test]
    fn test_toggle_and_eof_in_same_packet_queues_second_frame() {
        let mut assembler = FrameAssembler::default();
        assembler.process_packet(&uvc_packet(0x00, &[1; 8]));

        let result = assembler.process_packet(&uvc_packet(BFH_FID | BFH_EOF, &[2; 5]));
        match result {
            ProcessResult::Frame(frame) => assert_eq!(frame.data, vec![1; 8]),
            other => panic!("expected frame, got {:?}", other),
        }

        let queued = assembler.take_queued().expect("second frame queued");
        assert_eq!(queued.data, vec![2; 5]);
        assert_eq!(queued.boundary, Boundary::EndOfFrame);
        assert!(assembler.take_queued().is_none());
    }

    #[test]
    fn test_invalid_header_copies_raw_packet() {
        let mut assembler = FrameAssembler::default();
        // hlen 0xFF exceeds packet length
        let packet = [0xFF, 0x02, 0x10, 0x20];
        assert_eq!(assembler.process_packet(&packet), ProcessResult::Accumulating);
        assert_eq!(assembler.buffer_len(), 4);
        // EOF bit in a raw packet means nothing
        assert_eq!(assembler.frame_id(), None);
    }

    #[test]
    fn test_raw_copy_keeps_identity_tracking() {
        let mut assembler = FrameAssembler::default();
        assembler.process_packet(&uvc_packet(BFH_FID, &[1; 4]));
        assembler.process_packet(&[0x01, 0x00, 0x00]);
        assert_eq!(assembler.frame_id(), Some(true));
        assert_eq!(assembler.buffer_len(), 7);
    }

    #[test]
    fn test_error_packet_resets_state() {
        let mut assembler = FrameAssembler::default();
        assembler.process_packet(&uvc_packet(BFH_FID, &[0xAB; 32]));

        let error_packet = [0x02, BFH_ERR, 0xAB, 0xCD];
        assert_eq!(assembler.process_packet(&error_packet), ProcessResult::Skipped);
        assert_eq!(assembler.buffer_len(), 0);
        assert_eq!(assembler.frame_id(), None);

        // No boundary on the next packet since identity is unknown again
        assert_eq!(
            assembler.process_packet(&uvc_packet(0x00, &[1; 4])),
            ProcessResult::Accumulating
        );
    }

    #[test]
    fn test_capacity_clips_payload() {
        let mut assembler = FrameAssembler::new(100);
        assembler.process_packet(&uvc_packet(0x00, &[1; 60]));
        assembler.process_packet(&uvc_packet(0x00, &[2; 60]));

        assert_eq!(assembler.buffer_len(), 100);
        assert!(assembler.is_full());

        let frame = assembler.flush(Boundary::Capacity);
        assert!(frame.truncated);
        assert_eq!(frame.len(), 100);
        assert_eq!(assembler.truncated_frames(), 1);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut assembler = FrameAssembler::default();
        assembler.process_packet(&uvc_packet(BFH_FID, &[0x42; 3]));

        assembler.reset();

        assert_eq!(assembler.buffer_len(), 0);
        assert_eq!(assembler.frame_id(), None);
    }

    // =========================================================================
    // FrameReader Tests
    // =========================================================================

    #[test]
    fn test_reader_retries_timeouts_and_overflows() {
        let transport = ScriptedTransport::new()
            .timeout()
            .packet(uvc_packet(0x00, &[5; 64]))
            .overflow()
            .timeout()
            .packet(uvc_packet(BFH_EOF, &[6; 64]));

        let mut reader =
            FrameReader::new(transport, FrameAssembler::default(), ReadOptions::default());
        let frame = reader.read_frame(&RunFlag::new()).unwrap();

        assert_eq!(frame.len(), 128);
        assert_eq!(frame.boundary, Boundary::EndOfFrame);
    }

    #[test]
    fn test_reader_surfaces_fatal_error() {
        let transport = ScriptedTransport::new()
            .packet(uvc_packet(0x00, &[5; 16]))
            .fatal("device unplugged");

        let mut reader =
            FrameReader::new(transport, FrameAssembler::default(), ReadOptions::default());
        let err = reader.read_frame(&RunFlag::new()).unwrap_err();
        assert_eq!(err, TransportError::Fatal("device unplugged".to_string()));
    }

    #[test]
    fn test_reader_returns_partial_on_close() {
        let transport = ScriptedTransport::new().packet(uvc_packet(0x00, &[9; 10]));

        let mut reader =
            FrameReader::new(transport, FrameAssembler::default(), ReadOptions::default());
        let frame = reader.read_frame(&RunFlag::new()).unwrap();
        assert_eq!(frame.len(), 10);
        assert_eq!(frame.boundary, Boundary::Closed);
    }

    #[test]
    fn test_reader_honours_cancellation() {
        let running = RunFlag::new();
        running.stop();

        let transport = ScriptedTransport::new().packet(uvc_packet(BFH_EOF, &[1; 10]));
        let mut reader =
            FrameReader::new(transport, FrameAssembler::default(), ReadOptions::default());

        let frame = reader.read_frame(&running).unwrap();
        assert!(frame.is_empty());
        assert_eq!(frame.boundary, Boundary::Cancelled);
    }

    #[test]
    fn test_reader_idle_limit() {
        let transport = ScriptedTransport::new()
            .packet(uvc_packet(0x00, &[1; 10]))
            .timeout()
            .timeout()
            .timeout();
        let options = ReadOptions {
            max_idle_reads: Some(2),
            ..ReadOptions::default()
        };

        let mut reader = FrameReader::new(transport, FrameAssembler::default(), options);
        let frame = reader.read_frame(&RunFlag::new()).unwrap();
        assert!(frame.is_empty());
        assert_eq!(frame.boundary, Boundary::Idle);
        assert_eq!(reader.assembler().buffer_len(), 10);
    }

    #[test]
    fn test_reader_resumes_frame_after_idle() {
        let transport = ScriptedTransport::new()
            .packet(uvc_packet(0x00, &[1; 10]))
            .timeout()
            .packet(uvc_packet(BFH_EOF, &[2; 10]));
        let options = ReadOptions {
            max_idle_reads: Some(1),
            ..ReadOptions::default()
        };

        let mut reader = FrameReader::new(transport, FrameAssembler::default(), options);
        let running = RunFlag::new();
        assert_eq!(reader.read_frame(&running).unwrap().boundary, Boundary::Idle);

        let frame = reader.read_frame(&running).unwrap();
        assert_eq!(frame.boundary, Boundary::EndOfFrame);
        assert_eq!(frame.data, [[1u8; 10], [2u8; 10]].concat());
    }

    #[test]
    fn test_reader_stops_at_capacity() {
        let transport = ScriptedTransport::new()
            .packet(uvc_packet(0x00, &[1; 40]))
            .packet(uvc_packet(0x00, &[2; 40]))
            .packet(uvc_packet(0x00, &[3; 40]));

        let mut reader =
            FrameReader::new(transport, FrameAssembler::new(64), ReadOptions::default());
        let frame = reader.read_frame(&RunFlag::new()).unwrap();
        assert_eq!(frame.len(), 64);
        assert_eq!(frame.boundary, Boundary::Capacity);
        assert!(frame.truncated);
    }

    #[test]
    fn test_reader_delivers_queued_frame_first() {
        let transport = ScriptedTransport::new()
            .packet(uvc_packet(0x00, &[1; 8]))
            .packet(uvc_packet(BFH_FID | BFH_EOF, &[2; 8]))
            .packet(uvc_packet(BFH_EOF, &[3; 8]));

        let mut reader =
            FrameReader::new(transport, FrameAssembler::default(), ReadOptions::default());
        let running = RunFlag::new();

        assert_eq!(reader.read_frame(&running).unwrap().data, vec![1; 8]);
        assert_eq!(reader.read_frame(&running).unwrap().data, vec![2; 8]);
        assert_eq!(reader.read_frame(&running).unwrap().data, vec![3; 8]);
    }
}
