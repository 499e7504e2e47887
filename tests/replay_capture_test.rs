//! Integration tests for recording a packet stream and replaying it.
//!
//! A synthetic stream is recorded in the raw dump format, loaded back with
//! its metadata sidecar and pushed through the viewer pipeline, exactly as
//! the `rawdump` and `replay` subcommands do with a real device.

use std::path::Path;

use ir_scope_lib::capture::{read_metadata, record_to_dir, CaptureMetadata, RecordOptions};
use ir_scope_lib::cli;
use ir_scope_lib::config::ViewerConfig;
use ir_scope_lib::replay::{replay_all_frames, ReplayConfig, ReplayTransport};
use ir_scope_lib::test_utils::{
    interleaved_frame, smooth_frame, PacketGenerator, ScriptedTransport,
};
use ir_scope_lib::transport::{PacketSource, RunFlag, TransportError};

fn record(dir: &Path, frames: &[Vec<u8>], negotiated: Option<u32>) -> std::path::PathBuf {
    let mut gen = PacketGenerator::new(512);
    let mut transport = ScriptedTransport::new();
    for frame in frames {
        transport = transport.packets(gen.packetize(frame)).timeout();
    }

    let result = record_to_dir(
        &mut transport,
        dir,
        CaptureMetadata::for_device(negotiated),
        &RecordOptions::default(),
        &RunFlag::new(),
    )
    .unwrap();
    result.packets_path
}

fn replay_config(dir: &Path) -> ViewerConfig {
    ViewerConfig {
        width: 50,
        height: 30,
        output_dir: dir.to_path_buf(),
        ..ViewerConfig::default()
    }
}

// ============================================================================
// Recording
// ============================================================================

#[test]
fn test_recording_writes_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let frames = vec![smooth_frame(1500, 80), smooth_frame(1500, 82)];
    let path = record(dir.path(), &frames, Some(1500));

    let metadata = read_metadata(&path.with_extension("json")).unwrap();
    assert_eq!(metadata.negotiated_frame_size, 1500);
    assert_eq!(metadata.vendor_id, 0x2104);
    assert_eq!(metadata.product_id, 0x0313);
    // 1500 bytes in 512-byte payloads: 3 packets per frame
    assert_eq!(metadata.total_packets, 6);
    assert_eq!(metadata.total_bytes, std::fs::metadata(&path).unwrap().len());
}

#[test]
fn test_recorded_frames_replay_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let frames = vec![smooth_frame(1500, 80), interleaved_frame(700), smooth_frame(2048, 30)];
    let path = record(dir.path(), &frames, None);

    assert_eq!(replay_all_frames(&path).unwrap(), frames);
}

#[test]
fn test_replay_transport_reads_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let path = record(dir.path(), &[smooth_frame(600, 90)], Some(600));

    let mut replay = ReplayTransport::load(&path, ReplayConfig::default()).unwrap();
    assert_eq!(replay.negotiated_frame_size(), Some(600));
    assert_eq!(replay.packet_count(), 2);

    let mut buf = vec![0u8; 1024];
    assert!(replay.read_packet(&mut buf, Default::default()).is_ok());
    assert!(replay.read_packet(&mut buf, Default::default()).is_ok());
    assert_eq!(
        replay.read_packet(&mut buf, Default::default()),
        Err(TransportError::Closed)
    );
}

// ============================================================================
// Headless replay through the viewer
// ============================================================================

#[test]
fn test_replay_counts_frames() {
    let dir = tempfile::tempdir().unwrap();
    let frames = vec![
        smooth_frame(1500, 80),
        interleaved_frame(1500),
        smooth_frame(1500, 81),
        smooth_frame(600, 80),
    ];
    let path = record(dir.path(), &frames, None);

    let summary =
        cli::replay(replay_config(dir.path()), &path, false, false, &RunFlag::new()).unwrap();

    assert_eq!(summary.seen, 4);
    assert_eq!(summary.accepted, 2);
    assert_eq!(summary.rejected.stripe, 1);
    assert_eq!(summary.rejected.size, 1);
}

#[test]
fn test_replay_accumulates_to_negotiated_size() {
    let dir = tempfile::tempdir().unwrap();
    let fragments: Vec<Vec<u8>> = (0..6).map(|_| smooth_frame(500, 80)).collect();
    let path = record(dir.path(), &fragments, Some(1500));

    let mut config = replay_config(dir.path());
    config.accumulate = true;
    let summary = cli::replay(config, &path, false, false, &RunFlag::new()).unwrap();

    assert_eq!(summary.seen, 6);
    assert_eq!(summary.accepted, 2);
}

#[test]
fn test_replay_writes_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = record(dir.path(), &[smooth_frame(1500, 80)], None);
    let config = replay_config(dir.path());
    let snapshot = config.snapshot_path();

    cli::replay(config, &path, false, true, &RunFlag::new()).unwrap();

    let pgm = std::fs::read(snapshot).unwrap();
    assert!(pgm.starts_with(b"P5\n50 30\n255\n"));
    assert_eq!(pgm.len(), b"P5\n50 30\n255\n".len() + 50 * 30);
}

#[test]
fn test_replay_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let result = cli::replay(
        replay_config(dir.path()),
        &dir.path().join("missing.bin"),
        false,
        false,
        &RunFlag::new(),
    );
    assert!(result.is_err());
}
