#![allow(dead_code)] // Not every test binary uses every helper

use omxenc::engine::sim::{
    CONFIG_MAGIC, FRAME_MAGIC, FRAME_RECORD_LEN, SimConfig, SimulatedEncoder, fnv1a64,
};
use omxenc::engine::{Session, SessionConfig};
use omxenc::stats::SessionReport;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Bytes of 16x16 YUV 4:2:0 frames used by most fixtures
pub const SMALL: u32 = 16;
pub const SMALL_FRAME: usize = (SMALL * SMALL * 3 / 2) as usize;

/// Deterministic content of frame `index`; every frame differs
pub fn frame_bytes(frame_size: usize, index: usize) -> Vec<u8> {
    (0..frame_size)
        .map(|j| (index.wrapping_mul(31) ^ j.wrapping_mul(7)) as u8)
        .collect()
}

/// Write `frames` consecutive frames to `dir/name`
pub fn write_frames(dir: &Path, name: &str, frame_size: usize, frames: usize) -> PathBuf {
    let path = dir.join(name);
    let mut bytes = Vec::with_capacity(frame_size * frames);
    for i in 0..frames {
        bytes.extend(frame_bytes(frame_size, i));
    }
    fs::write(&path, bytes).expect("write fixture");
    path
}

/// Small, unpaced session over frames `first..=last`
pub fn small_config(id: usize, input: PathBuf, output: PathBuf, first: u64, last: u64) -> SessionConfig {
    let mut cfg = SessionConfig::new(id, input, output);
    cfg.width = SMALL;
    cfg.height = SMALL;
    cfg.first_frame = first;
    cfg.last_frame = last;
    cfg.buffer_count = 3;
    cfg.timing.start_delay_us = 0;
    cfg.timing.event_timeout_ms = 5_000;
    cfg.timing.eos_drain_timeout_ms = 10_000;
    cfg
}

pub fn run_with(cfg: SessionConfig, sim: SimConfig) -> (SessionReport, Arc<SimulatedEncoder>) {
    let component = SimulatedEncoder::new(sim).expect("simulated encoder");
    let report = Session::new(cfg, component.clone()).run();
    (report, component)
}

pub fn run(cfg: SessionConfig) -> (SessionReport, Arc<SimulatedEncoder>) {
    run_with(cfg, SimConfig::default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub sequence: u32,
    pub len: u32,
    pub hash: u64,
}

/// Decoded simulated bitstream: optional config header plus frame records
#[derive(Debug)]
pub struct Bitstream {
    pub role: Option<String>,
    pub width: u32,
    pub height: u32,
    /// Profile and level, or quality and zero for JPEG
    pub coding: [u32; 2],
    pub records: Vec<Record>,
}

pub fn parse_bitstream(bytes: &[u8], role: &str) -> Bitstream {
    let mut rest = bytes;
    let mut parsed = Bitstream {
        role: None,
        width: 0,
        height: 0,
        coding: [0; 2],
        records: Vec::new(),
    };

    if rest.starts_with(CONFIG_MAGIC) {
        let header = 4 + role.len() + 16;
        assert!(rest.len() >= header, "truncated config header");
        assert_eq!(&rest[4..4 + role.len()], role.as_bytes());
        parsed.role = Some(role.to_string());
        let words: Vec<u32> = rest[4 + role.len()..header]
            .chunks(4)
            .map(|w| u32::from_le_bytes(w.try_into().unwrap()))
            .collect();
        parsed.width = words[0];
        parsed.height = words[1];
        parsed.coding = [words[2], words[3]];
        rest = &rest[header..];
    }

    assert_eq!(rest.len() % FRAME_RECORD_LEN, 0, "trailing bytes after records");
    for chunk in rest.chunks(FRAME_RECORD_LEN) {
        assert_eq!(&chunk[..4], FRAME_MAGIC);
        parsed.records.push(Record {
            sequence: u32::from_le_bytes(chunk[4..8].try_into().unwrap()),
            len: u32::from_le_bytes(chunk[8..12].try_into().unwrap()),
            hash: u64::from_le_bytes(chunk[12..20].try_into().unwrap()),
        });
    }
    parsed
}

pub fn read_bitstream(path: &Path, role: &str) -> Bitstream {
    parse_bitstream(&fs::read(path).expect("read output"), role)
}

/// Hashes the records of source frames `frames` should carry
pub fn expected_hashes(frame_size: usize, frames: impl IntoIterator<Item = usize>) -> Vec<u64> {
    frames
        .into_iter()
        .map(|i| fnv1a64(&frame_bytes(frame_size, i)))
        .collect()
}

pub fn hashes(bitstream: &Bitstream) -> Vec<u64> {
    bitstream.records.iter().map(|r| r.hash).collect()
}
