//! Boundary between the session engine and an encoder component.
//!
//! The component is driven through [`Component`] and reports back through
//! [`ComponentCallbacks`], invoked on threads the session does not own.
//! Buffers move across this boundary by value.

use std::fmt;
use std::sync::Arc;

use super::core::{
    AvcExtension, BufferHeader, ComponentVersion, LifecycleState, OmxError, OmxResult,
    PortDefinition, PortRange, VideoCoding,
};

/// Commands accepted by [`Component::send_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StateSet(LifecycleState),
    PortDisable(u32),
    PortEnable(u32),
}

/// Parameter selectors for [`Component::get_parameter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamIndex {
    PortDefinition(u32),
    /// Video-domain port range.
    VideoInit,
    /// Image-domain port range.
    ImageInit,
    StandardComponentRole,
    VideoBitrate(u32),
    VideoAvc(u32),
    VideoHevc(u32),
    /// Vendor AVC extension block.
    AvcExtension(u32),
    Deblocking(u32),
    /// Initial I frame quantization.
    Quantization(u32),
    /// JPEG quality.
    QFactor(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    PortDefinition(PortDefinition),
    VideoInit(PortRange),
    ImageInit(PortRange),
    StandardComponentRole(String),
    VideoBitrate { port: u32, target_bps: u32 },
    VideoAvc(VideoCoding),
    VideoHevc(VideoCoding),
    AvcExtension(AvcExtension),
    Deblocking { port: u32, enabled: bool },
    Quantization { port: u32, qp_i: u32 },
    QFactor { port: u32, quality: u32 },
}

/// Asynchronous notifications from the component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentEvent {
    CmdComplete(Command),
    Error(OmxError),
    /// A flagged buffer (end of stream) left the given port.
    BufferFlag { port: u32, flags: u32 },
}

/// A submission the component refused. The buffer comes back with the error
/// so the caller still owns it.
#[derive(Debug)]
pub struct Rejected {
    pub error: OmxError,
    pub buffer: BufferHeader,
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer {} rejected: {}", self.buffer.id(), self.error)
    }
}

impl From<Rejected> for OmxError {
    fn from(rejected: Rejected) -> Self {
        rejected.error
    }
}

pub type SubmitResult = Result<(), Rejected>;

/// Client-side view of an encoder component.
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> OmxResult<ComponentVersion>;

    /// Register the completion callbacks. Must be called before any command.
    fn set_callbacks(&self, callbacks: Arc<dyn ComponentCallbacks>) -> OmxResult<()>;

    /// Issue a command. Completion is reported through
    /// [`ComponentCallbacks::on_event`].
    fn send_command(&self, command: Command) -> OmxResult<()>;

    fn get_state(&self) -> OmxResult<LifecycleState>;

    fn get_parameter(&self, index: ParamIndex) -> OmxResult<Param>;

    fn set_parameter(&self, param: Param) -> OmxResult<()>;

    fn allocate_buffer(&self, port: u32, size: usize) -> OmxResult<BufferHeader>;

    fn free_buffer(&self, buffer: BufferHeader) -> OmxResult<()>;

    /// Hand a filled input buffer to the component.
    fn empty_this_buffer(&self, buffer: BufferHeader) -> SubmitResult;

    /// Hand an empty output buffer to the component.
    fn fill_this_buffer(&self, buffer: BufferHeader) -> SubmitResult;

    /// Release the component handle. No call is valid afterwards.
    fn free_handle(&self) -> OmxResult<()>;
}

/// Entry points the component calls back into.
pub trait ComponentCallbacks: Send + Sync {
    fn on_event(&self, component: &dyn Component, event: ComponentEvent) -> OmxResult<()>;

    /// An input buffer was consumed and is owned by the client again.
    fn empty_buffer_done(&self, component: &dyn Component, buffer: BufferHeader)
    -> OmxResult<()>;

    /// An output buffer was filled and is owned by the client again.
    fn fill_buffer_done(&self, component: &dyn Component, buffer: BufferHeader) -> OmxResult<()>;
}
