// Full session runs: configure, stream, tear down

use omxenc::engine::core::{
    AVC_PROFILE_HIGH, CodingType, EXPECTED_SPEC_VERSION, FrameRate, SpecVersion,
};
use omxenc::engine::sim::{SimConfig, SimulatedEncoder};
use omxenc::engine::Session;
use omxenc::stats::SessionStatus;
use std::thread;
use std::time::Duration;

use crate::common::helpers::*;

#[test]
fn test_session_encodes_requested_range() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 10);
    let output = dir.path().join("out.264");

    let (report, sim) = run(small_config(0, input, output.clone(), 2, 6));

    assert_eq!(report.status, SessionStatus::Completed, "{:?}", report.error);
    assert_eq!(report.frames_submitted, 5);
    assert_eq!(report.frames_encoded, 5);
    assert_eq!(report.codec_config_buffers, 1);
    assert!(sim.is_released(), "component handle must be released");

    let stream = read_bitstream(&output, "video_encoder.avc");
    assert_eq!(stream.role.as_deref(), Some("video_encoder.avc"));
    assert_eq!((stream.width, stream.height), (SMALL, SMALL));
    assert_eq!(hashes(&stream), expected_hashes(SMALL_FRAME, 2..=6));
    let sequences: Vec<u32> = stream.records.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    assert!(stream.records.iter().all(|r| r.len as usize == SMALL_FRAME));

    let written = std::fs::metadata(&output).unwrap().len();
    assert_eq!(report.bytes_written, written);
}

#[test]
fn test_half_output_rate_takes_every_other_frame() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 10);
    let output = dir.path().join("out.264");
    let mut cfg = small_config(0, input, output.clone(), 0, 9);
    cfg.input_rate = FrameRate::new(30, 1);
    cfg.output_rate = FrameRate::new(15, 1);

    let (report, _sim) = run(cfg);
    assert_eq!(report.status, SessionStatus::Completed, "{:?}", report.error);

    let stream = read_bitstream(&output, "video_encoder.avc");
    assert_eq!(hashes(&stream), expected_hashes(SMALL_FRAME, [0, 2, 4, 6, 8]));
}

#[test]
fn test_image_role_uses_two_ports() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 3);
    let output = dir.path().join("out.jpg");
    let mut cfg = small_config(0, input, output.clone(), 0, 2);
    cfg.coding = CodingType::Jpeg;

    let (report, _sim) = run(cfg);
    assert_eq!(report.status, SessionStatus::Completed, "{:?}", report.error);
    let stream = read_bitstream(&output, "image_encoder.jpeg");
    assert_eq!(stream.records.len(), 3);
}

#[test]
fn test_version_mismatch_prevents_streaming() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 3);
    let output = dir.path().join("out.264");
    let older = SpecVersion::new(1, 0, 0, 0);
    assert_ne!(older, EXPECTED_SPEC_VERSION);

    let (report, sim) = run_with(
        small_config(0, input, output.clone(), 0, 2),
        SimConfig {
            spec_version: older,
            ..SimConfig::default()
        },
    );

    assert_eq!(report.error_code.as_deref(), Some("VersionMismatch"));
    assert_eq!(report.frames_submitted, 0);
    assert!(sim.is_released());
    assert!(!output.exists(), "no output is opened before the version check");
}

#[test]
fn test_bitrate_and_buffer_size_settings_are_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 2);
    let mut cfg = small_config(0, input, dir.path().join("out.265"), 0, 1);
    cfg.coding = CodingType::Hevc;
    cfg.bitrate = Some(256_000);
    cfg.buffer_size = Some(8192);

    let (report, _sim) = run(cfg);
    assert_eq!(report.status, SessionStatus::Completed, "{:?}", report.error);
    assert_eq!(report.frames_encoded, 2);
}

#[test]
fn test_component_fault_fails_session_and_releases_handle() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 200);
    let output = dir.path().join("out.264");
    let cfg = small_config(0, input, output, 0, 199);

    let sim = SimulatedEncoder::new(SimConfig {
        latency: Duration::from_millis(2),
        ..SimConfig::default()
    })
    .unwrap();
    let session = Session::new(cfg, sim.clone());
    let runner = thread::spawn(move || session.run());

    thread::sleep(Duration::from_millis(60));
    sim.inject_fault();

    let report = runner.join().unwrap();
    assert_eq!(report.status, SessionStatus::Failed);
    let code = report.error_code.clone().unwrap();
    assert!(
        code == "InvalidState" || code == "IncorrectStateOperation",
        "unexpected error code {}",
        code
    );
    assert!(report.frames_submitted < 200);
    assert!(sim.is_released());
}

#[test]
fn test_avc_defaults_to_high_profile_level_51() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 2);
    let output = dir.path().join("out.264");

    let (report, _sim) = run(small_config(0, input, output.clone(), 0, 1));
    assert_eq!(report.status, SessionStatus::Completed, "{:?}", report.error);

    let stream = read_bitstream(&output, "video_encoder.avc");
    assert_eq!(stream.coding, [AVC_PROFILE_HIGH, 51]);
}

#[test]
fn test_requested_codec_settings_reach_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 2);

    let hevc_out = dir.path().join("out.265");
    let mut cfg = small_config(0, input.clone(), hevc_out.clone(), 0, 1);
    cfg.coding = CodingType::Hevc;
    cfg.codec.profile = Some(0x02);
    cfg.codec.level = Some(120);
    cfg.codec.quantization = Some(30);
    let (report, _sim) = run(cfg);
    assert_eq!(report.status, SessionStatus::Completed, "{:?}", report.error);
    assert_eq!(read_bitstream(&hevc_out, "video_encoder.hevc").coding, [0x02, 120]);

    let jpeg_out = dir.path().join("out.jpg");
    let mut cfg = small_config(1, input, jpeg_out.clone(), 0, 0);
    cfg.coding = CodingType::Jpeg;
    cfg.codec.quantization = Some(90);
    let (report, _sim) = run(cfg);
    assert_eq!(report.status, SessionStatus::Completed, "{:?}", report.error);
    assert_eq!(read_bitstream(&jpeg_out, "image_encoder.jpeg").coding, [90, 0]);
}

#[test]
fn test_level_outside_the_coding_fails_before_streaming() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 2);
    let output = dir.path().join("out.264");
    let mut cfg = small_config(0, input, output, 0, 1);
    // 93 is HEVC level 3.1; AVC has no such level.
    cfg.codec.level = Some(93);

    let (report, sim) = run(cfg);
    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(report.error_code.as_deref(), Some("BadParameter"));
    assert_eq!(report.frames_submitted, 0);
    assert!(sim.is_released());
}
