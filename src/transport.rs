//! Packet transport abstraction
//!
//! The capture loop only talks to the camera through [`PacketSource`], so the
//! USB bulk endpoint, a replayed capture file and scripted test transports are
//! interchangeable. Cancellation is cooperative via [`RunFlag`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Largest packet a single bulk read can deliver.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Default per-packet read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Outcome of a failed packet read.
///
/// Only [`TransportError::Fatal`] ever escapes the capture loop. Timeouts and
/// overflows are retried, [`TransportError::Closed`] ends capture cleanly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No packet arrived within the timeout.
    #[error("read timed out")]
    Timeout,

    /// The device sent more data than the read buffer could hold.
    #[error("packet overflowed the read buffer")]
    Overflow,

    /// The source has no more packets (end of a replayed capture).
    #[error("transport closed")]
    Closed,

    /// Unrecoverable I/O failure.
    #[error("transport failure: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Whether the read should simply be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Overflow)
    }
}

/// A blocking source of raw packets.
pub trait PacketSource {
    /// Read the next packet into `buf`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] describing why no packet was delivered.
    fn read_packet(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;
}

impl<T: PacketSource + ?Sized> PacketSource for &mut T {
    fn read_packet(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read_packet(buf, timeout)
    }
}

impl<T: PacketSource + ?Sized> PacketSource for Box<T> {
    fn read_packet(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read_packet(buf, timeout)
    }
}

/// Process-wide "keep running" flag.
///
/// Cloned into the Ctrl+C handler; every loop checks it between reads.
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    /// Create a flag in the running state.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Whether loops should keep going.
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Ask every loop observing this flag to wind down.
    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}
