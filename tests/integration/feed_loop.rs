// Feed loops: remote frame source and real-time pacing

use omxenc::engine::core::FrameRate;
use omxenc::engine::osal::{OsalThread, ThreadPriority};
use omxenc::engine::source::{self, ProducerGeometry};
use omxenc::engine::sim::{SimConfig, SimulatedEncoder};
use omxenc::engine::{Session, SessionConfig};
use omxenc::stats::{SessionReport, SessionStatus};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::helpers::*;

/// Run `cfg` against a loopback producer streaming `frames_file`.
fn run_remote(
    cfg: SessionConfig,
    frames_file: &Path,
    geometry: ProducerGeometry,
    max_frames: Option<u64>,
) -> (SessionReport, u64) {
    let (client, server) = source::loopback_pair();
    let path = frames_file.to_path_buf();
    let in_flight = cfg.buffer_count as usize;
    let producer = OsalThread::spawn("producer-test", ThreadPriority::default(), move || {
        server.serve_file(&path, geometry, max_frames, in_flight)
    })
    .unwrap();

    let sim = SimulatedEncoder::new(SimConfig::default()).unwrap();
    let report = Session::new(cfg, sim.clone())
        .with_remote(Arc::new(client))
        .run();
    assert!(sim.is_released());

    let sent = producer.join().unwrap().unwrap();
    (report, sent)
}

fn small_geometry() -> ProducerGeometry {
    ProducerGeometry {
        width: SMALL,
        height: SMALL,
        stride: SMALL,
    }
}

#[test]
fn test_remote_frames_are_encoded_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let frames = write_frames(dir.path(), "remote.yuv", SMALL_FRAME, 4);
    let output = dir.path().join("out.264");
    let cfg = small_config(0, "plink:remote".into(), output.clone(), 0, 3);

    let (report, sent) = run_remote(cfg, &frames, small_geometry(), None);

    assert_eq!(report.status, SessionStatus::Completed, "{:?}", report.error);
    assert_eq!(sent, 4);
    assert_eq!(report.frames_submitted, 4);

    let stream = read_bitstream(&output, "video_encoder.avc");
    assert_eq!(hashes(&stream), expected_hashes(SMALL_FRAME, 0..4));
}

#[test]
fn test_remote_producer_limited_by_frame_count() {
    let dir = tempfile::tempdir().unwrap();
    let frames = write_frames(dir.path(), "remote.yuv", SMALL_FRAME, 10);
    let output = dir.path().join("out.264");
    let cfg = small_config(0, "plink:remote".into(), output.clone(), 0, 9);

    let (report, sent) = run_remote(cfg, &frames, small_geometry(), Some(3));

    assert_eq!(report.status, SessionStatus::Completed, "{:?}", report.error);
    assert_eq!(sent, 3);
    assert_eq!(read_bitstream(&output, "video_encoder.avc").records.len(), 3);
}

#[test]
fn test_remote_geometry_mismatch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let wide = ProducerGeometry {
        width: SMALL * 2,
        height: SMALL,
        stride: SMALL * 2,
    };
    let frames = write_frames(dir.path(), "remote.yuv", wide.frame_size(), 2);
    let cfg = small_config(0, "plink:remote".into(), dir.path().join("out.264"), 0, 1);

    let (report, _sent) = run_remote(cfg, &frames, wide, None);

    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(report.error_code.as_deref(), Some("BadParameter"));
    assert_eq!(report.frames_submitted, 0);
}

#[test]
fn test_paced_session_respects_frame_period() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 5);
    let output = dir.path().join("out.264");
    let mut cfg = small_config(0, input, output.clone(), 0, 4);
    cfg.pace_rate = Some(FrameRate::new(100, 1));

    let started = Instant::now();
    let (report, _sim) = run(cfg);
    let elapsed = started.elapsed();

    assert_eq!(report.status, SessionStatus::Completed, "{:?}", report.error);
    assert_eq!(report.frames_submitted, 5);
    // Frame 4 is not due before 40ms after frame 0.
    assert!(elapsed >= Duration::from_millis(40), "finished in {:?}", elapsed);
    assert_eq!(read_bitstream(&output, "video_encoder.avc").records.len(), 5);
}

#[test]
fn test_unpaced_session_reports_no_skips() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 3);
    let (report, _sim) = run(small_config(0, input, dir.path().join("out.264"), 0, 2));
    assert_eq!(report.skipped_frames, 0);
}
