//! Multi-transfer frame stitching
//!
//! On some firmware a single boundary-delimited chunk is only part of the
//! image the device negotiated. When enabled, the accumulator concatenates
//! chunks until the negotiated frame size is reached and only then yields a
//! frame. Bytes past the target are discarded.

use std::borrow::Cow;

/// Stitches boundary-delimited chunks into frames of a fixed target size.
#[derive(Debug)]
pub struct Accumulator {
    enabled: bool,
    target: usize,
    buffer: Vec<u8>,
    offset: usize,
}

impl Accumulator {
    /// Create a disabled accumulator.
    ///
    /// `target` is the negotiated maximum frame size; `capacity` bounds it.
    pub fn new(target: usize, capacity: usize) -> Self {
        let mut accumulator = Self {
            enabled: false,
            target: 0,
            buffer: Vec::new(),
            offset: 0,
        };
        accumulator.set_target(target, capacity);
        accumulator
    }

    /// Whether stitching is requested.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether chunks are actually being stitched (enabled with a usable target).
    pub fn is_active(&self) -> bool {
        self.enabled && self.target > 0
    }

    /// Current stitch target in bytes.
    pub fn target(&self) -> usize {
        self.target
    }

    /// Bytes collected towards the next frame.
    pub fn pending(&self) -> usize {
        self.offset
    }

    /// Turn stitching on or off. Any partial frame is dropped.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.offset = 0;
    }

    /// Flip stitching, returning the new state.
    pub fn toggle(&mut self) -> bool {
        self.set_enabled(!self.enabled);
        self.enabled
    }

    /// Change the stitch target. Any partial frame is dropped.
    pub fn set_target(&mut self, target: usize, capacity: usize) {
        let clamped = target.min(capacity);
        if clamped != target {
            log::warn!(
                "Negotiated frame size {} exceeds frame capacity, using {}",
                target,
                clamped
            );
        }
        self.target = clamped;
        self.offset = 0;
        if self.buffer.len() != clamped {
            self.buffer = vec![0u8; clamped];
        }
    }

    /// Feed one chunk.
    ///
    /// When inactive the chunk is passed through. When active, returns a frame
    /// of exactly `target` bytes once enough data has been collected, and
    /// `None` otherwise.
    pub fn feed<'a>(&mut self, chunk: &'a [u8]) -> Option<Cow<'a, [u8]>> {
        if !self.is_active() {
            return Some(Cow::Borrowed(chunk));
        }

        let take = chunk.len().min(self.target - self.offset);
        self.buffer[self.offset..self.offset + take].copy_from_slice(&chunk[..take]);
        self.offset += take;

        if self.offset >= self.target {
            self.offset = 0;
            Some(Cow::Owned(self.buffer.clone()))
        } else {
            None
        }
    }
}
