use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

use crate::engine::osal::GuardedMemory;

/// Raw frame input port.
pub const INPUT_PORT: u32 = 0;
/// Encoded bitstream output port.
pub const OUTPUT_PORT: u32 = 1;
/// Overlay (OSD) input port.
pub const OVERLAY_PORT: u32 = 2;

/// Component lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Loaded,
    Idle,
    Executing,
    Paused,
    WaitingForResources,
    Invalid,
}

impl LifecycleState {
    /// Whether `self -> target` is an edge of the lifecycle graph.
    ///
    /// `Invalid` is terminal: every state may fall into it and nothing leaves it.
    pub fn can_transition_to(self, target: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, target) {
            (Invalid, _) => false,
            (_, Invalid) => true,
            (Loaded, Idle) | (Idle, Loaded) => true,
            (Loaded, WaitingForResources) | (WaitingForResources, Loaded) => true,
            (WaitingForResources, Idle) => true,
            (Idle, Executing) | (Executing, Idle) => true,
            (Executing, Paused) | (Paused, Executing) => true,
            (Paused, Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Loaded => "Loaded",
            LifecycleState::Idle => "Idle",
            LifecycleState::Executing => "Executing",
            LifecycleState::Paused => "Paused",
            LifecycleState::WaitingForResources => "WaitingForResources",
            LifecycleState::Invalid => "Invalid",
        };
        f.write_str(name)
    }
}

/// IL interface version tuple (major.minor.revision.step).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
    pub step: u8,
}

impl SpecVersion {
    pub const fn new(major: u8, minor: u8, revision: u8, step: u8) -> Self {
        Self {
            major,
            minor,
            revision,
            step,
        }
    }
}

impl fmt::Display for SpecVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.revision, self.step
        )
    }
}

/// Interface version this harness is written against.
pub const EXPECTED_SPEC_VERSION: SpecVersion = SpecVersion::new(1, 1, 2, 0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentVersion {
    pub name: String,
    pub component: SpecVersion,
    pub spec: SpecVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortDomain {
    Video,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorFormat {
    Unused,
    Yuv420Planar,
    Yuv420SemiPlanar,
    Argb8888,
    Monochrome,
}

impl ColorFormat {
    /// Bytes of one tightly packed picture of `width` x `height`.
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            ColorFormat::Yuv420Planar | ColorFormat::Yuv420SemiPlanar => {
                Some(pixels + (pixels >> 1))
            }
            ColorFormat::Argb8888 => Some(pixels * 4),
            ColorFormat::Monochrome => Some(pixels / 8),
            ColorFormat::Unused => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodingType {
    Unused,
    Avc,
    Hevc,
    Jpeg,
}

impl CodingType {
    /// Standard component role string for this coding.
    pub fn role(self) -> Option<&'static str> {
        match self {
            CodingType::Avc => Some("video_encoder.avc"),
            CodingType::Hevc => Some("video_encoder.hevc"),
            CodingType::Jpeg => Some("image_encoder.jpeg"),
            CodingType::Unused => None,
        }
    }

    pub fn is_image(self) -> bool {
        matches!(self, CodingType::Jpeg)
    }
}

/// How a port's buffers are backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferMode {
    /// Client-visible memory filled from a file.
    Normal,
    /// Externally owned frames handed over by a remote frame source.
    Dma,
}

/// Exact rational frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate {
    pub numer: u32,
    pub denom: u32,
}

impl FrameRate {
    pub const fn new(numer: u32, denom: u32) -> Self {
        Self { numer, denom }
    }

    pub fn is_valid(&self) -> bool {
        self.numer > 0 && self.denom > 0
    }

    /// Decode a Q16 fixed point rate, reduced to lowest terms.
    pub fn from_q16(q16: u32) -> Self {
        let g = gcd(q16, 1 << 16).max(1);
        Self::new(q16 / g, (1 << 16) / g)
    }

    pub fn to_q16(&self) -> u32 {
        if self.denom == 0 {
            return 0;
        }
        ((u64::from(self.numer) << 16) / u64::from(self.denom)) as u32
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Picture geometry and coding of a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFormat {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub slice_height: u32,
    pub color: ColorFormat,
    pub coding: CodingType,
    pub bitrate: u32,
    /// Frame rate in Q16 fixed point.
    pub framerate_q16: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDefinition {
    pub index: u32,
    pub direction: Direction,
    pub domain: PortDomain,
    pub enabled: bool,
    pub populated: bool,
    pub buffer_count_min: u32,
    pub buffer_count_actual: u32,
    pub buffer_size: usize,
    pub buffer_alignment: u32,
    pub format: PortFormat,
}

/// First port index and number of ports of one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u32,
    pub count: u32,
}

/// AVC High profile as the component encodes it.
pub const AVC_PROFILE_HIGH: u32 = 0x08;
/// Every single-bit AVC profile code, Baseline through High 4:4:4.
pub const AVC_PROFILE_MASK: u32 = 0x7f;
pub const HEVC_PROFILE_MAIN: u32 = 0x01;
pub const HEVC_PROFILE_MASK: u32 = 0x03;

/// AVC levels as written on the command line; 99 is level 1b.
pub const AVC_LEVELS: &[u32] = &[
    10, 99, 11, 12, 13, 20, 21, 22, 30, 31, 32, 40, 41, 42, 50, 51, 52, 60, 61, 62,
];
/// HEVC main-tier levels times 30, e.g. 93 is level 3.1.
pub const HEVC_LEVELS: &[u32] = &[30, 60, 63, 90, 93, 120, 123, 150, 153, 156, 180, 183, 186];

/// Highest quantization parameter of AVC and HEVC.
pub const MAX_QP: u32 = 51;

/// Profile, level and GOP layout of an AVC or HEVC output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCoding {
    pub port: u32,
    pub profile: u32,
    pub level: u32,
    /// P frames between two I frames.
    pub p_frames: u32,
    pub ref_frames: u32,
    /// Entropy coding; AVC only.
    pub cabac: bool,
}

impl VideoCoding {
    /// Reject a profile or level outside the tables of `coding`.
    pub fn check(&self, coding: CodingType) -> Result<(), String> {
        let (mask, levels) = match coding {
            CodingType::Avc => (AVC_PROFILE_MASK, AVC_LEVELS),
            CodingType::Hevc => (HEVC_PROFILE_MASK, HEVC_LEVELS),
            other => return Err(format!("{:?} has no video coding parameters", other)),
        };
        if !self.profile.is_power_of_two() || self.profile & !mask != 0 {
            return Err(format!("{:?} profile {:#x}", coding, self.profile));
        }
        if !levels.contains(&self.level) {
            return Err(format!("{:?} level {}", coding, self.level));
        }
        if self.ref_frames == 0 {
            return Err("at least one reference frame".to_string());
        }
        if coding == CodingType::Hevc && self.cabac {
            return Err("CABAC is implied by HEVC".to_string());
        }
        Ok(())
    }
}

/// Vendor extension of the AVC encoder: rate control buffer, speed preset
/// and per-frame-type QP bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvcExtension {
    pub port: u32,
    /// Coded picture buffer size in bits; 0 lets the encoder pick.
    pub cpb_size: u32,
    pub preset: u32,
    pub intra_qp_delta: i32,
    pub qp_min_i: u32,
    pub qp_max_i: u32,
    pub qp_min_pb: u32,
    pub qp_max_pb: u32,
}

impl AvcExtension {
    pub fn check(&self) -> Result<(), String> {
        let bounds = [
            ("I", self.qp_min_i, self.qp_max_i),
            ("P/B", self.qp_min_pb, self.qp_max_pb),
        ];
        for (kind, min, max) in bounds {
            if min > max || max > MAX_QP {
                return Err(format!("{} frame QP range {}..={}", kind, min, max));
            }
        }
        if self.intra_qp_delta.unsigned_abs() > MAX_QP {
            return Err(format!("intra QP delta {}", self.intra_qp_delta));
        }
        Ok(())
    }
}

/// Buffer flag word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const EOS: BufferFlags = BufferFlags(0x0000_0001);
    pub const CODEC_CONFIG: BufferFlags = BufferFlags(0x0000_0080);

    pub const fn empty() -> Self {
        BufferFlags(0)
    }

    pub fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: BufferFlags) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 | rhs.0)
    }
}

/// Frame owned by a remote frame source while the component reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalFrame {
    pub frame_id: u64,
}

/// Buffer descriptor exchanged between client and component.
///
/// Holding a `BufferHeader` by value is ownership: submitting it to the
/// component moves it away, and the matching completion callback moves it
/// back. Nothing else can reach the memory in between.
#[derive(Debug)]
pub struct BufferHeader {
    id: u32,
    port: u32,
    memory: GuardedMemory,
    pub filled_len: usize,
    pub offset: usize,
    pub flags: BufferFlags,
    pub external: Option<ExternalFrame>,
}

impl BufferHeader {
    pub fn new(id: u32, port: u32, memory: GuardedMemory) -> Self {
        Self {
            id,
            port,
            memory,
            filled_len: 0,
            offset: 0,
            flags: BufferFlags::empty(),
            external: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn alloc_len(&self) -> usize {
        self.memory.len()
    }

    pub fn data(&self) -> &[u8] {
        self.memory.as_slice()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.memory.as_mut_slice()
    }

    /// The filled region `[offset, offset + filled_len)`, clamped to the allocation.
    pub fn payload(&self) -> &[u8] {
        let data = self.memory.as_slice();
        let start = self.offset.min(data.len());
        let end = start.saturating_add(self.filled_len).min(data.len());
        &data[start..end]
    }

    pub fn is_eos(&self) -> bool {
        self.flags.contains(BufferFlags::EOS)
    }

    pub fn is_codec_config(&self) -> bool {
        self.flags.contains(BufferFlags::CODEC_CONFIG)
    }

    /// Clear length, offset and flags before handing the buffer back for refill.
    pub fn reset(&mut self) {
        self.filled_len = 0;
        self.offset = 0;
        self.flags = BufferFlags::empty();
    }

    pub fn memory(&self) -> &GuardedMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut GuardedMemory {
        &mut self.memory
    }

    pub fn into_memory(self) -> GuardedMemory {
        self.memory
    }
}
