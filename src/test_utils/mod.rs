//! Test utilities for `ir-scope`
//!
//! Provides synthetic packet generation and a scripted transport for
//! validating the frame pipeline without physical USB hardware.

pub mod packet_generator;
pub mod scripted;

pub use packet_generator::*;
pub use scripted::*;
