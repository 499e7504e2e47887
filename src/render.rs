//! Decode/render mapping for raw IR frames
//!
//! The pixel layout of this sensor is not documented, so the viewer offers
//! several interpretations of the same bytes and lets the user cycle through
//! them:
//!
//! - **Raw**: one byte per pixel
//! - **Deinterleave even/odd**: every second byte, starting at offset 0 or 1
//! - **16-bit LE**: byte pairs as little-endian samples
//!
//! Every mode applies a per-frame min/max contrast stretch to 0..=255 and
//! leaves pixels without source data black.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Opaque alpha for ARGB output.
pub const OPAQUE: u32 = 0xFF00_0000;

/// How frame bytes map to pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DecodeMode {
    /// One byte per pixel
    #[default]
    #[serde(rename = "raw-8bit")]
    Raw,
    /// Even-offset bytes only
    #[serde(rename = "deint-even")]
    DeinterleaveEven,
    /// Odd-offset bytes only
    #[serde(rename = "deint-odd")]
    DeinterleaveOdd,
    /// Little-endian 16-bit samples
    #[serde(rename = "16bit-LE")]
    SixteenBitLe,
}

impl DecodeMode {
    /// Every mode in cycling order.
    pub const ALL: [DecodeMode; 4] = [
        Self::Raw,
        Self::DeinterleaveEven,
        Self::DeinterleaveOdd,
        Self::SixteenBitLe,
    ];

    /// Next mode in the cycle, wrapping around.
    pub fn next(self) -> Self {
        match self {
            Self::Raw => Self::DeinterleaveEven,
            Self::DeinterleaveEven => Self::DeinterleaveOdd,
            Self::DeinterleaveOdd => Self::SixteenBitLe,
            Self::SixteenBitLe => Self::Raw,
        }
    }

    /// Display name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Raw => "raw-8bit",
            Self::DeinterleaveEven => "deint-even",
            Self::DeinterleaveOdd => "deint-odd",
            Self::SixteenBitLe => "16bit-LE",
        }
    }

    /// Parse from a config or environment string
    pub fn from_env_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "raw" | "raw-8bit" | "8bit" => Some(Self::Raw),
            "deint-even" | "even" => Some(Self::DeinterleaveEven),
            "deint-odd" | "odd" => Some(Self::DeinterleaveOdd),
            "16bit-le" | "16bit" | "u16" => Some(Self::SixteenBitLe),
            _ => None,
        }
    }
}

impl fmt::Display for DecodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stretch `samples` to 0..=255 into the front of `out`.
///
/// Integer division truncates, so a midpoint lands on 127 rather than 128.
fn stretch<I>(samples: I, out: &mut [u8])
where
    I: Iterator<Item = u32> + Clone,
{
    let Some((min, max)) = samples
        .clone()
        .fold(None, |acc: Option<(u32, u32)>, s| match acc {
            None => Some((s, s)),
            Some((min, max)) => Some((min.min(s), max.max(s))),
        })
    else {
        return;
    };

    let range = (max - min).max(1);
    for (dst, s) in out.iter_mut().zip(samples) {
        *dst = ((s - min) * 255 / range).min(255) as u8;
    }
}

/// Map frame bytes to a `width * height` grayscale image
///
/// # Arguments
///
/// * `frame` - Frame bytes after metadata stripping and accumulation
/// * `width` - Output width in pixels
/// * `height` - Output height in pixels
/// * `mode` - Byte interpretation
///
/// # Returns
///
/// A buffer of exactly `width * height` bytes. Frames shorter than two bytes
/// render fully black; pixels past the end of the data stay black.
pub fn render(frame: &[u8], width: usize, height: usize, mode: DecodeMode) -> Vec<u8> {
    let npix = width * height;
    let mut out = vec![0u8; npix];
    if frame.len() < 2 {
        return out;
    }

    match mode {
        DecodeMode::Raw => {
            let limit = frame.len().min(npix);
            stretch(frame[..limit].iter().map(|&b| u32::from(b)), &mut out);
        }
        DecodeMode::DeinterleaveEven | DecodeMode::DeinterleaveOdd => {
            let start = usize::from(mode == DecodeMode::DeinterleaveOdd);
            let samples = frame[start..].iter().step_by(2).take(npix);
            stretch(samples.map(|&b| u32::from(b)), &mut out);
        }
        DecodeMode::SixteenBitLe => {
            let samples = frame
                .chunks_exact(2)
                .take(npix)
                .map(|pair| u32::from(u16::from_le_bytes([pair[0], pair[1]])));
            stretch(samples, &mut out);
        }
    }

    out
}

/// Expand grayscale to opaque ARGB (`0xFFvvvvvv`).
pub fn to_argb(gray: &[u8]) -> Vec<u32> {
    gray.iter()
        .map(|&v| {
            let v = u32::from(v);
            OPAQUE | (v << 16) | (v << 8) | v
        })
        .collect()
}

/// A rendered image ready for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFrame {
    /// Width in pixels
    pub width: usize,
    /// Height in pixels
    pub height: usize,
    /// Mode used to decode the bytes
    pub mode: DecodeMode,
    /// One grayscale byte per pixel, row-major
    pub pixels: Vec<u8>,
}

impl RenderedFrame {
    /// Render `frame` with the given geometry and mode.
    pub fn from_frame(frame: &[u8], width: usize, height: usize, mode: DecodeMode) -> Self {
        Self {
            width,
            height,
            mode,
            pixels: render(frame, width, height, mode),
        }
    }

    /// ARGB pixels for a texture upload.
    pub fn argb(&self) -> Vec<u32> {
        to_argb(&self.pixels)
    }
}

/// Destination for rendered frames
pub trait FrameSink {
    /// Display or store a frame.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the frame could not be written.
    fn present(&mut self, frame: &RenderedFrame) -> io::Result<()>;
}

/// Sink that discards frames (headless replay).
#[derive(Debug, Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn present(&mut self, _frame: &RenderedFrame) -> io::Result<()> {
        Ok(())
    }
}

/// Keeps the latest frame as a binary PGM file
///
/// The file is written next to its final path and renamed into place so
/// image viewers polling it never see a partial write.
#[derive(Debug)]
pub struct PgmSnapshotSink {
    path: PathBuf,
    written: u64,
}

impl PgmSnapshotSink {
    /// Write snapshots to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: 0,
        }
    }

    /// Snapshot path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frames written so far.
    pub fn frames_written(&self) -> u64 {
        self.written
    }
}

/// Encode a grayscale image as binary PGM (P5).
pub fn write_pgm<W: Write>(mut writer: W, frame: &RenderedFrame) -> io::Result<()> {
    write!(writer, "P5\n{} {}\n255\n", frame.width, frame.height)?;
    writer.write_all(&frame.pixels)?;
    writer.flush()
}

impl FrameSink for PgmSnapshotSink {
    fn present(&mut self, frame: &RenderedFrame) -> io::Result<()> {
        let tmp = self.path.with_extension("pgm.tmp");
        {
            let file = fs::File::create(&tmp)?;
            write_pgm(io::BufWriter::new(file), frame)?;
        }
        fs::rename(&tmp, &self.path)?;
        self.written += 1;
        Ok(())
    }
}
