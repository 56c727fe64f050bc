// Two sessions at once through the session pool

use omxenc::engine::core::CodingType;
use omxenc::engine::osal::ThreadPriority;
use omxenc::engine::sim::{SimConfig, SimulatedEncoder};
use omxenc::engine::{Session, SessionMessage, SessionPool};
use omxenc::stats::SessionStatus;
use std::time::Duration;

use crate::common::helpers::*;

fn sim_with_latency(us: u64) -> std::sync::Arc<SimulatedEncoder> {
    SimulatedEncoder::new(SimConfig {
        latency: Duration::from_micros(us),
        jitter_us: 200,
        ..SimConfig::default()
    })
    .unwrap()
}

#[test]
fn test_pool_starts_empty() {
    let pool = SessionPool::new(ThreadPriority::default());
    assert_eq!(pool.active_count(), 0, "Pool should start with 0 active sessions");
    assert!(pool.is_empty());
    assert!(pool.is_finished());
}

#[test]
fn test_two_sessions_run_independently() {
    let dir = tempfile::tempdir().unwrap();
    let input0 = write_frames(dir.path(), "a.yuv", SMALL_FRAME, 12);
    let input1 = write_frames(dir.path(), "b.yuv", SMALL_FRAME, 8);
    let out0 = dir.path().join("a.264");
    let out1 = dir.path().join("b.jpg");

    let cfg0 = small_config(0, input0, out0.clone(), 0, 11);
    let mut cfg1 = small_config(1, input1, out1.clone(), 0, 7);
    cfg1.coding = CodingType::Jpeg;

    let mut pool = SessionPool::new(ThreadPriority::default());
    pool.spawn(Session::new(cfg0, sim_with_latency(500))).unwrap();
    pool.spawn(Session::new(cfg1, sim_with_latency(300))).unwrap();
    assert_eq!(pool.len(), 2);

    let mut started = Vec::new();
    let mut completed = Vec::new();
    while completed.len() < 2 {
        match pool.receiver().recv_timeout(Duration::from_secs(30)).unwrap() {
            SessionMessage::SessionStarted { session } => started.push(session),
            SessionMessage::SessionCompleted(report) => completed.push(report.session),
            SessionMessage::SessionFailed { session, error, .. } => {
                panic!("session {} failed: {}", session, error)
            }
        }
    }
    started.sort();
    completed.sort();
    assert_eq!(started, vec![0, 1]);
    assert_eq!(completed, vec![0, 1]);

    let reports: Vec<_> = pool.join_all().into_iter().map(Result::unwrap).collect();
    assert_eq!(reports[0].frames_encoded, 12);
    assert_eq!(reports[1].frames_encoded, 8);

    let a = read_bitstream(&out0, "video_encoder.avc");
    let b = read_bitstream(&out1, "image_encoder.jpeg");
    assert_eq!(hashes(&a), expected_hashes(SMALL_FRAME, 0..12));
    assert_eq!(hashes(&b), expected_hashes(SMALL_FRAME, 0..8));
}

#[test]
fn test_failing_session_does_not_affect_sibling() {
    let dir = tempfile::tempdir().unwrap();
    let good_input = write_frames(dir.path(), "good.yuv", SMALL_FRAME, 6);
    let good_out = dir.path().join("good.264");
    let bad_out = dir.path().join("bad.264");

    let good = small_config(0, good_input, good_out.clone(), 0, 5);
    let bad = small_config(1, dir.path().join("missing.yuv"), bad_out, 0, 5);

    let bad_sim = sim_with_latency(0);
    let mut pool = SessionPool::new(ThreadPriority::default());
    pool.spawn(Session::new(good, sim_with_latency(200))).unwrap();
    pool.spawn(Session::new(bad, bad_sim.clone())).unwrap();

    let reports: Vec<_> = pool.join_all().into_iter().map(Result::unwrap).collect();
    assert_eq!(reports[0].status, SessionStatus::Completed, "{:?}", reports[0].error);
    assert_eq!(reports[1].status, SessionStatus::Failed);
    assert_eq!(reports[1].error_code.as_deref(), Some("StreamCorrupt"));
    assert!(bad_sim.is_released());

    let stream = read_bitstream(&good_out, "video_encoder.avc");
    assert_eq!(stream.records.len(), 6);
}

#[test]
fn test_reports_have_distinct_run_ids() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 2);

    let mut pool = SessionPool::new(ThreadPriority::default());
    for id in 0..2 {
        let cfg = small_config(id, input.clone(), dir.path().join(format!("{}.264", id)), 0, 1);
        pool.spawn(Session::new(cfg, sim_with_latency(0))).unwrap();
    }
    let reports: Vec<_> = pool.join_all().into_iter().map(Result::unwrap).collect();
    assert_ne!(reports[0].run_id, reports[1].run_id);
    assert!(reports.iter().all(|r| r.status == SessionStatus::Completed));
}
