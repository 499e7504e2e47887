//! Command-line surface
//!
//! `view` (the default) drives the camera live, `dump` prints frame
//! diagnostics, `rawdump` records the packet stream and `replay` feeds a
//! recording back through the viewer pipeline.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::capture::{record_to_dir, CaptureMetadata, RecordOptions};
use crate::config::ViewerConfig;
use crate::dump::run_dump;
use crate::frame_assembler::{FrameAssembler, FrameReader, ReadOptions};
use crate::render::{DecodeMode, FrameSink, NullSink, PgmSnapshotSink};
use crate::replay::{ReplayConfig, ReplayTransport};
use crate::transport::{PacketSource, RunFlag};
use crate::usb::open_stream;
use crate::viewer::{run_loop, Control, Viewer, ViewerSummary};

/// Timed-out reads before the reader returns to the control loop.
const IDLE_READS_PER_POLL: u32 = 1;

/// Raw IR stream viewer for UVC bulk cameras
#[derive(Debug, Parser)]
#[command(name = "ir-scope", version, about)]
pub struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, env = "IRSCOPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Initial display width in pixels
    #[arg(long, global = true)]
    pub width: Option<usize>,

    /// Initial decode mode (raw-8bit, deint-even, deint-odd, 16bit-LE)
    #[arg(long, global = true, value_parser = parse_mode)]
    pub mode: Option<DecodeMode>,

    /// Directory for saved frames, dumps and snapshots
    #[arg(long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Start with accumulation on
    #[arg(long, global = true)]
    pub accumulate: bool,

    /// Start with hold mode off
    #[arg(long, global = true)]
    pub no_hold: bool,

    /// Start with the stripe filter off
    #[arg(long, global = true)]
    pub no_stripe_filter: bool,

    /// What to run
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Live view with stdin controls (default)
    View,
    /// Print diagnostics for the first frames and save the first one
    Dump {
        /// Frames to capture
        #[arg(long)]
        frames: Option<usize>,
    },
    /// Record the raw packet stream
    Rawdump {
        /// Stop after this many bytes
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Run a recorded stream through the pipeline
    Replay {
        /// Capture file written by `rawdump`
        file: PathBuf,
        /// Start over at the end of the file
        #[arg(long = "loop")]
        loop_playback: bool,
        /// Write the latest accepted frame as a PGM snapshot
        #[arg(long)]
        snapshot: bool,
    },
}

fn parse_mode(s: &str) -> Result<DecodeMode, String> {
    DecodeMode::from_env_str(s).ok_or_else(|| format!("unknown decode mode '{}'", s))
}

impl Cli {
    /// Overlay command-line flags on a loaded configuration.
    pub fn apply_overrides(&self, config: &mut ViewerConfig) {
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if self.accumulate {
            config.accumulate = true;
        }
        if self.no_hold {
            config.stability.hold = false;
        }
        if self.no_stripe_filter {
            config.stability.stripe_filter = false;
        }
    }
}

/// Forward stdin lines as controls until EOF or a quit request.
///
/// A quit also clears `running`, so a read in progress winds down without
/// waiting for the loop to drain the channel.
pub fn spawn_control_reader(
    tx: Sender<Control>,
    running: RunFlag,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("controls".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match Control::parse(&line) {
                    Some(Control::Quit) => {
                        let _ = tx.send(Control::Quit);
                        running.stop();
                        break;
                    }
                    Some(control) => {
                        if tx.send(control).is_err() {
                            break;
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => log::warn!("Unknown control '{}'", line.trim()),
                }
            }
        })
}

fn frame_reader<S: PacketSource>(source: S, config: &ViewerConfig) -> FrameReader<S> {
    FrameReader::new(
        source,
        FrameAssembler::new(config.frame_capacity),
        ReadOptions {
            timeout: config.read_timeout(),
            max_idle_reads: Some(IDLE_READS_PER_POLL),
            packet_size: config.packet_size,
        },
    )
}

/// Run one subcommand to completion.
///
/// # Errors
///
/// Returns an error if the device or a file cannot be opened, or if the
/// transport fails fatally.
pub fn execute(command: Command, config: ViewerConfig, running: &RunFlag) -> Result<()> {
    match command {
        Command::View => view(config, running),
        Command::Dump { frames } => dump(config, frames, running),
        Command::Rawdump { limit } => rawdump(config, limit, running),
        Command::Replay {
            file,
            loop_playback,
            snapshot,
        } => {
            let summary = replay(config, &file, loop_playback, snapshot, running)?;
            println!("{}", summary);
            Ok(())
        }
    }
}

fn view(config: ViewerConfig, running: &RunFlag) -> Result<()> {
    let (transport, negotiated) = open_stream().context("failed to open camera")?;
    log::info!(
        "Streaming: mode={} width={} negotiated={}",
        config.mode,
        config.width,
        negotiated.map_or_else(|| "none".to_string(), |size| format!("{} bytes", size))
    );
    log::info!(
        "Controls: m=mode +/-=width (++/-- x10) r=reset s=stripe a=accum h=hold l=lock \
         b=brightness d=save q=quit"
    );

    let (tx, rx) = mpsc::channel();
    spawn_control_reader(tx, running.clone()).context("failed to start control reader")?;

    let mut sink = PgmSnapshotSink::new(config.snapshot_path());
    log::info!("Writing snapshots to {}", sink.path().display());

    let mut reader = frame_reader(transport, &config);
    let mut viewer = Viewer::new(config, negotiated);
    run_loop(&mut reader, &mut viewer, &mut sink, &rx, running)?;
    Ok(())
}

fn dump(config: ViewerConfig, frames: Option<usize>, running: &RunFlag) -> Result<()> {
    let (transport, negotiated) = open_stream().context("failed to open camera")?;
    if let Some(size) = negotiated {
        println!("Negotiated frame size: {} bytes", size);
    }

    let count = frames.unwrap_or(config.dump_frames);
    let mut reader = frame_reader(transport, &config);
    let report = run_dump(
        &mut reader,
        count,
        &config.stability.classifier,
        config.min_fragment_len,
        Some(config.output_dir.as_path()),
        running,
    )?;

    for record in &report.records {
        println!("{}", record);
    }
    if let Some(path) = report.saved {
        println!("Saved first frame to {}", path.display());
    }
    Ok(())
}

fn rawdump(config: ViewerConfig, limit: Option<usize>, running: &RunFlag) -> Result<()> {
    let (mut transport, negotiated) = open_stream().context("failed to open camera")?;
    let options = RecordOptions {
        limit: limit.unwrap_or(config.raw_dump_limit),
        timeout: config.read_timeout(),
        packet_size: config.packet_size,
    };

    let result = record_to_dir(
        &mut transport,
        &config.output_dir,
        CaptureMetadata::for_device(negotiated),
        &options,
        running,
    )?;
    println!(
        "Recorded {} packets ({} bytes) to {}",
        result.metadata.total_packets,
        result.metadata.total_bytes,
        result.packets_path.display()
    );
    Ok(())
}

/// Replay a capture file headlessly and return the final counters.
///
/// # Errors
///
/// Returns an error if the file cannot be loaded.
pub fn replay(
    config: ViewerConfig,
    file: &std::path::Path,
    loop_playback: bool,
    snapshot: bool,
    running: &RunFlag,
) -> Result<ViewerSummary> {
    let transport = ReplayTransport::load(
        file,
        ReplayConfig { loop_playback },
    )
    .with_context(|| format!("failed to load {}", file.display()))?;
    let negotiated = transport.negotiated_frame_size();

    let mut sink: Box<dyn FrameSink> = if snapshot {
        Box::new(PgmSnapshotSink::new(config.snapshot_path()))
    } else {
        Box::new(NullSink)
    };

    // No interactive controls during replay; a closed channel is ignored.
    let (_, rx) = mpsc::channel::<Control>();

    let mut reader = frame_reader(transport, &config);
    let mut viewer = Viewer::new(config, negotiated);
    let summary = run_loop(&mut reader, &mut viewer, &mut *sink, &rx, running)?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::NullSink;
    use crate::transport::TransportError;
    use std::time::{Duration, Instant};

    /// Camera that never delivers a packet.
    struct SilentCamera;

    impl PacketSource for SilentCamera {
        fn read_packet(
            &mut self,
            _buf: &mut [u8],
            timeout: Duration,
        ) -> std::result::Result<usize, TransportError> {
            std::thread::sleep(timeout);
            Err(TransportError::Timeout)
        }
    }

    #[test]
    fn test_quit_applied_while_camera_silent() {
        let config = ViewerConfig {
            read_timeout_ms: 20,
            ..ViewerConfig::default()
        };
        let mut reader = frame_reader(SilentCamera, &config);
        let mut viewer = Viewer::new(config, None);
        let (tx, rx) = mpsc::channel();
        let running = RunFlag::new();

        // Stand-in for Ctrl+C so a regression fails instead of hanging.
        let watchdog = running.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(5));
            watchdog.stop();
        });
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let _ = tx.send(Control::CycleMode);
            let _ = tx.send(Control::Quit);
        });

        let start = Instant::now();
        run_loop(&mut reader, &mut viewer, &mut NullSink, &rx, &running).unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(viewer.mode(), DecodeMode::DeinterleaveEven);
        assert!(!running.is_running());
    }

    #[test]
    fn test_default_command_is_view() {
        let cli = Cli::try_parse_from(["ir-scope"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "ir-scope",
            "--width",
            "320",
            "--mode",
            "deint-odd",
            "--no-hold",
            "--accumulate",
            "view",
        ])
        .unwrap();

        let mut config = ViewerConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.width, 320);
        assert_eq!(config.mode, DecodeMode::DeinterleaveOdd);
        assert!(!config.stability.hold);
        assert!(config.stability.stripe_filter);
        assert!(config.accumulate);
    }

    #[test]
    fn test_bad_mode_rejected() {
        assert!(Cli::try_parse_from(["ir-scope", "--mode", "rgb"]).is_err());
    }

    #[test]
    fn test_replay_args() {
        let cli = Cli::try_parse_from(["ir-scope", "replay", "cap.bin", "--loop"]).unwrap();
        match cli.command {
            Some(Command::Replay {
                file,
                loop_playback,
                snapshot,
            }) => {
                assert_eq!(file, PathBuf::from("cap.bin"));
                assert!(loop_playback);
                assert!(!snapshot);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_rawdump_limit() {
        let cli = Cli::try_parse_from(["ir-scope", "rawdump", "--limit", "4096"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Rawdump { limit: Some(4096) })));
    }
}
