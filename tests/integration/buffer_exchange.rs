// Input buffer layouts: slices, overlay pictures, cached buffers

use omxenc::engine::core::ColorFormat;
use omxenc::engine::OverlayConfig;
use omxenc::engine::sim::fnv1a64;
use omxenc::stats::SessionStatus;

use crate::common::helpers::*;

#[test]
fn test_sliced_input_submits_every_slice() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 4);
    let output = dir.path().join("out.264");
    let mut cfg = small_config(0, input, output.clone(), 0, 3);
    cfg.slice_height = Some(SMALL / 2);

    let (report, sim) = run(cfg);
    assert_eq!(report.status, SessionStatus::Completed, "{:?}", report.error);
    assert_eq!(report.frames_submitted, 4);
    assert_eq!(sim.held_buffers(), 0);

    let stream = read_bitstream(&output, "video_encoder.avc");
    assert_eq!(stream.records.len(), 8, "two slices per frame");
    assert!(stream.records.iter().all(|r| r.len as usize == SMALL_FRAME / 2));
}

#[test]
fn test_wide_stride_places_every_row_at_the_stride() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 3);
    let output = dir.path().join("out.264");
    let mut cfg = small_config(0, input, output.clone(), 0, 2);
    cfg.stride = Some(SMALL * 2);

    let (report, sim) = run(cfg);
    assert_eq!(report.status, SessionStatus::Completed, "{:?}", report.error);
    assert_eq!(report.frames_submitted, 3);
    assert_eq!(sim.held_buffers(), 0);

    // Luma rows at 32 bytes, chroma rows at 16; padding stays zero.
    let strided: Vec<u64> = (0..3)
        .map(|i| {
            let frame = frame_bytes(SMALL_FRAME, i);
            let (w, h) = (SMALL as usize, SMALL as usize);
            let mut laid = vec![0u8; 2 * SMALL_FRAME];
            let mut at = 0;
            let mut from = 0;
            for (row_bytes, rows, stride) in [(w, h, 2 * w), (w / 2, h / 2, w), (w / 2, h / 2, w)] {
                for r in 0..rows {
                    laid[at + r * stride..at + r * stride + row_bytes]
                        .copy_from_slice(&frame[from + r * row_bytes..from + (r + 1) * row_bytes]);
                }
                at += rows * stride;
                from += rows * row_bytes;
            }
            fnv1a64(&laid)
        })
        .collect();

    let stream = read_bitstream(&output, "video_encoder.avc");
    assert!(stream.records.iter().all(|r| r.len as usize == 2 * SMALL_FRAME));
    assert_eq!(hashes(&stream), strided);
}

#[test]
fn test_first_slice_carries_top_rows_of_every_plane() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 1);
    let output = dir.path().join("out.264");
    let mut cfg = small_config(0, input, output.clone(), 0, 0);
    cfg.slice_height = Some(SMALL / 2);

    let (report, _sim) = run(cfg);
    assert_eq!(report.status, SessionStatus::Completed, "{:?}", report.error);

    let frame = frame_bytes(SMALL_FRAME, 0);
    let luma = (SMALL * SMALL) as usize;
    let chroma = luma / 4;
    let mut top = Vec::new();
    top.extend_from_slice(&frame[..luma / 2]);
    top.extend_from_slice(&frame[luma..luma + chroma / 2]);
    top.extend_from_slice(&frame[luma + chroma..luma + chroma + chroma / 2]);

    let stream = read_bitstream(&output, "video_encoder.avc");
    assert_eq!(stream.records[0].hash, fnv1a64(&top));
}

#[test]
fn test_semiplanar_slices() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 2);
    let output = dir.path().join("out.264");
    let mut cfg = small_config(0, input, output.clone(), 0, 1);
    cfg.color = ColorFormat::Yuv420SemiPlanar;
    cfg.slice_height = Some(SMALL / 4);

    let (report, _sim) = run(cfg);
    assert_eq!(report.status, SessionStatus::Completed, "{:?}", report.error);
    let stream = read_bitstream(&output, "video_encoder.avc");
    assert_eq!(stream.records.len(), 8);
}

#[test]
fn test_overlay_pictures_accompany_frames() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 5);
    let overlay_frame = 16 * 16 * 4;
    // Fewer overlay pictures than frames: the overlay file loops.
    let osd = write_frames(dir.path(), "osd.argb", overlay_frame, 2);
    let output = dir.path().join("out.264");
    let mut cfg = small_config(0, input, output.clone(), 0, 4);
    cfg.overlay = Some(OverlayConfig {
        path: osd,
        width: 16,
        height: 16,
        color: ColorFormat::Argb8888,
    });

    let (report, sim) = run(cfg);
    assert_eq!(report.status, SessionStatus::Completed, "{:?}", report.error);
    assert_eq!(report.frames_submitted, 5);
    assert_eq!(sim.held_buffers(), 0);

    let stream = read_bitstream(&output, "video_encoder.avc");
    assert_eq!(hashes(&stream), expected_hashes(SMALL_FRAME, 0..5));
}

#[test]
fn test_missing_overlay_file_fails_session() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 2);
    let mut cfg = small_config(0, input, dir.path().join("out.264"), 0, 1);
    cfg.overlay = Some(OverlayConfig {
        path: dir.path().join("none.argb"),
        width: 16,
        height: 16,
        color: ColorFormat::Argb8888,
    });

    let (report, sim) = run(cfg);
    assert_eq!(report.status, SessionStatus::Failed);
    assert!(sim.is_released());
}

#[test]
fn test_cache_mode_reuses_buffers_past_end_of_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 3);
    let output = dir.path().join("out.264");
    let mut cfg = small_config(0, input, output.clone(), 0, 5);
    cfg.buffer_count = 2;
    cfg.cache_mode = true;

    let (report, _sim) = run(cfg);
    assert_eq!(report.status, SessionStatus::Completed, "{:?}", report.error);
    assert_eq!(report.frames_submitted, 6);

    let stream = read_bitstream(&output, "video_encoder.avc");
    assert_eq!(stream.records.len(), 6);
    assert_eq!(hashes(&stream)[..3], expected_hashes(SMALL_FRAME, 0..3)[..]);
}

#[test]
fn test_short_file_ends_stream_without_cache_mode() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_frames(dir.path(), "in.yuv", SMALL_FRAME, 3);
    let output = dir.path().join("out.264");
    let mut cfg = small_config(0, input, output.clone(), 0, 5);
    cfg.buffer_count = 2;

    let (report, _sim) = run(cfg);
    assert_eq!(report.status, SessionStatus::Completed, "{:?}", report.error);
    // Three frames plus the empty end-of-stream buffer.
    assert_eq!(report.frames_submitted, 4);
    assert_eq!(report.frames_encoded, 3);

    let stream = read_bitstream(&output, "video_encoder.avc");
    assert_eq!(hashes(&stream), expected_hashes(SMALL_FRAME, 0..3));
}
