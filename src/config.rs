//! Runtime configuration
//!
//! Every tunable of the viewer lives in [`ViewerConfig`]. Values are layered,
//! lowest precedence first:
//!
//! 1. built-in defaults
//! 2. an optional JSON file
//! 3. `IRSCOPE_*` environment variables
//! 4. command-line flags (applied by the binary)
//!
//! Unparseable environment values are logged and ignored rather than fatal.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame_assembler::DEFAULT_FRAME_CAPACITY;
use crate::render::DecodeMode;
use crate::stability::StabilityConfig;
use crate::transport::MAX_PACKET_SIZE;

/// Narrowest display width.
pub const MIN_WIDTH: usize = 10;

/// Tallest display height in rows.
pub const MAX_HEIGHT: usize = 4096;

/// Prefix shared by all environment overrides.
pub const ENV_PREFIX: &str = "IRSCOPE_";

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Config file is not valid JSON for this schema.
    #[error("invalid config file {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// A value is out of its allowed range.
    #[error("invalid value for {field}: {message}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

/// Viewer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Upper bound on one assembled frame in bytes
    pub frame_capacity: usize,
    /// Bulk read buffer size in bytes
    pub packet_size: usize,
    /// Per-packet read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Assembled frames shorter than this are dropped as fragments
    pub min_fragment_len: usize,
    /// Hold/lock and classifier settings
    pub stability: StabilityConfig,
    /// Initial display width in pixels
    pub width: usize,
    /// Display height in pixels
    pub height: usize,
    /// Widest display width reachable with the width controls
    pub max_width: usize,
    /// Start with multi-transfer stitching on
    pub accumulate: bool,
    /// Initial decode mode
    pub mode: DecodeMode,
    /// Directory for saved frames, dumps and snapshots
    pub output_dir: PathBuf,
    /// Snapshot file for the PGM sink, relative to `output_dir`
    pub snapshot_file: PathBuf,
    /// Status line interval in milliseconds
    pub status_interval_ms: u64,
    /// Byte budget for the raw packet dump
    pub raw_dump_limit: usize,
    /// Frames captured by the diagnostic dump
    pub dump_frames: usize,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            packet_size: MAX_PACKET_SIZE,
            read_timeout_ms: 500,
            min_fragment_len: 100,
            stability: StabilityConfig::default(),
            width: 642,
            height: 480,
            max_width: 1284,
            accumulate: false,
            mode: DecodeMode::Raw,
            output_dir: std::env::temp_dir(),
            snapshot_file: PathBuf::from("ir_scope_latest.pgm"),
            status_interval_ms: 1000,
            raw_dump_limit: 2 * 1024 * 1024,
            dump_frames: 30,
        }
    }
}

impl ViewerConfig {
    /// Load defaults, overlay an optional JSON file, then the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if the
    /// resulting values are out of range.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Overlay `IRSCOPE_*` variables from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay environment-style overrides from `lookup`.
    ///
    /// `lookup` receives the full variable name, e.g. `IRSCOPE_WIDTH`.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(value) = get("MODE") {
            match DecodeMode::from_env_str(&value) {
                Some(mode) => self.mode = mode,
                None => log::warn!("Unknown decode mode '{}', keeping '{}'", value, self.mode),
            }
        }
        override_parsed(&get, "WIDTH", &mut self.width);
        override_parsed(&get, "HEIGHT", &mut self.height);
        override_parsed(&get, "READ_TIMEOUT_MS", &mut self.read_timeout_ms);
        override_parsed(&get, "FRAME_CAPACITY", &mut self.frame_capacity);
        override_parsed(&get, "MIN_FRAGMENT_LEN", &mut self.min_fragment_len);
        override_parsed(
            &get,
            "DARK_THRESHOLD",
            &mut self.stability.classifier.dark_threshold,
        );
        override_parsed(
            &get,
            "STRIPE_THRESHOLD",
            &mut self.stability.classifier.stripe_threshold,
        );
        override_parsed(
            &get,
            "SIZE_TOLERANCE",
            &mut self.stability.size_tolerance_pct,
        );
        override_parsed(
            &get,
            "BRIGHTNESS_TOLERANCE",
            &mut self.stability.brightness_tolerance,
        );
        override_flag(&get, "STRIPE_FILTER", &mut self.stability.stripe_filter);
        override_flag(&get, "HOLD", &mut self.stability.hold);
        override_flag(&get, "ACCUMULATE", &mut self.accumulate);
        if let Some(dir) = get("OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
    }

    /// Check ranges and clamp the display width into `[MIN_WIDTH, max_width]`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for values the pipeline cannot run with.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.frame_capacity == 0 {
            return Err(invalid("frame_capacity", "must be non-zero"));
        }
        if self.packet_size < 2 {
            return Err(invalid("packet_size", "must hold at least a header"));
        }
        if self.height == 0 {
            return Err(invalid("height", "must be non-zero"));
        }
        if self.height > MAX_HEIGHT {
            return Err(invalid(
                "height",
                &format!("must be at most {}", MAX_HEIGHT),
            ));
        }
        if self.max_width < MIN_WIDTH {
            return Err(invalid(
                "max_width",
                &format!("must be at least {}", MIN_WIDTH),
            ));
        }
        if self.stability.size_tolerance_pct > 100 {
            return Err(invalid("size_tolerance_pct", "must be at most 100"));
        }
        if self.stability.classifier.sample_window == 0 {
            return Err(invalid("sample_window", "must be non-zero"));
        }

        let width = self.width.clamp(MIN_WIDTH, self.max_width);
        if width != self.width {
            log::warn!("Display width {} out of range, using {}", self.width, width);
            self.width = width;
        }
        Ok(())
    }

    /// Per-packet read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Status line interval.
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    /// Full path of the PGM snapshot.
    pub fn snapshot_path(&self) -> PathBuf {
        self.output_dir.join(&self.snapshot_file)
    }
}

fn invalid(field: &'static str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.to_string(),
    }
}

fn override_parsed<T, G>(get: &G, name: &str, slot: &mut T)
where
    T: std::str::FromStr + std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let Some(value) = get(name) else {
        return;
    };
    match value.trim().parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => log::warn!(
            "Invalid value '{}' for {}{}, keeping {}",
            value,
            ENV_PREFIX,
            name,
            slot
        ),
    }
}

fn override_flag<G>(get: &G, name: &str, slot: &mut bool)
where
    G: Fn(&str) -> Option<String>,
{
    let Some(value) = get(name) else {
        return;
    };
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => *slot = true,
        "0" | "false" | "off" | "no" => *slot = false,
        _ => log::warn!(
            "Invalid flag '{}' for {}{}, keeping {}",
            value,
            ENV_PREFIX,
            name,
            slot
        ),
    }
}
