mod error;
mod log;
mod types;

pub use error::{OmxError, OmxResult};
pub use log::{init_logging, parse_level};
pub use types::{
    AVC_LEVELS, AVC_PROFILE_HIGH, AVC_PROFILE_MASK, AvcExtension, BufferFlags, BufferHeader,
    BufferMode, CodingType, ColorFormat, ComponentVersion, Direction, EXPECTED_SPEC_VERSION,
    ExternalFrame, FrameRate, HEVC_LEVELS, HEVC_PROFILE_MAIN, HEVC_PROFILE_MASK, INPUT_PORT,
    LifecycleState, MAX_QP, OUTPUT_PORT, OVERLAY_PORT, PortDefinition, PortDomain, PortFormat,
    PortRange, SpecVersion, VideoCoding,
};
