//! Scripted packet source
//!
//! Replays a fixed list of reads, timeouts and errors through the
//! [`PacketSource`] interface, then reports the transport as closed.

use std::collections::VecDeque;
use std::time::Duration;

use crate::transport::{PacketSource, TransportError};

/// One scripted read outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedRead {
    /// Deliver these bytes
    Packet(Vec<u8>),
    /// Report a timeout
    Timeout,
    /// Report a buffer overflow
    Overflow,
    /// Report a fatal failure
    Fatal(String),
}

/// Packet source driven by a script
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    reads: VecDeque<ScriptedRead>,
    served: usize,
}

impl ScriptedTransport {
    /// Create an empty script
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet
    pub fn packet(mut self, packet: Vec<u8>) -> Self {
        self.reads.push_back(ScriptedRead::Packet(packet));
        self
    }

    /// Append several packets
    pub fn packets<I: IntoIterator<Item = Vec<u8>>>(mut self, packets: I) -> Self {
        self.reads
            .extend(packets.into_iter().map(ScriptedRead::Packet));
        self
    }

    /// Append a timeout
    pub fn timeout(mut self) -> Self {
        self.reads.push_back(ScriptedRead::Timeout);
        self
    }

    /// Append an overflow
    pub fn overflow(mut self) -> Self {
        self.reads.push_back(ScriptedRead::Overflow);
        self
    }

    /// Append a fatal error
    pub fn fatal(mut self, message: &str) -> Self {
        self.reads.push_back(ScriptedRead::Fatal(message.to_string()));
        self
    }

    /// Scripted reads not yet consumed
    pub fn remaining(&self) -> usize {
        self.reads.len()
    }

    /// Reads served so far, including errors
    pub fn served(&self) -> usize {
        self.served
    }
}

impl PacketSource for ScriptedTransport {
    fn read_packet(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        let Some(read) = self.reads.pop_front() else {
            return Err(TransportError::Closed);
        };
        self.served += 1;

        match read {
            ScriptedRead::Packet(packet) => {
                if packet.len() > buf.len() {
                    return Err(TransportError::Overflow);
                }
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            ScriptedRead::Timeout => Err(TransportError::Timeout),
            ScriptedRead::Overflow => Err(TransportError::Overflow),
            ScriptedRead::Fatal(message) => Err(TransportError::Fatal(message)),
        }
    }
}
