//! Error taxonomy shared by every layer of the session engine.

use thiserror::Error;

use super::types::{LifecycleState, SpecVersion};

/// Result type alias used across the engine.
pub type OmxResult<T> = std::result::Result<T, OmxError>;

/// Errors reported by the OSAL primitives, the component boundary and the
/// session engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OmxError {
    /// Invalid handle or argument.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// Allocation, thread or queue-capacity exhaustion.
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    /// The component woke us but is not in the state we waited for.
    #[error("component is in state {actual}, expected {expected}")]
    InvalidState {
        expected: LifecycleState,
        actual: LifecycleState,
    },

    /// A transition outside the lifecycle graph was requested.
    #[error("incorrect state transition {from} -> {to}")]
    IncorrectStateTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    /// The operation is not allowed in the component's current state.
    #[error("operation not allowed in current state: {0}")]
    IncorrectStateOperation(String),

    /// A bounded wait for a state transition elapsed.
    #[error("timed out after {timeout_ms} ms waiting for state {target}")]
    Timeout {
        target: LifecycleState,
        timeout_ms: u32,
    },

    /// The component never returned an end-of-stream output in time.
    #[error("timed out after {timeout_ms} ms waiting for end of stream")]
    EosTimeout { timeout_ms: u32 },

    /// Source or sink could not be opened, seeked, read or written.
    #[error("stream corrupt: {0}")]
    StreamCorrupt(String),

    /// Component interface version differs from the one this harness speaks.
    #[error("IL version mismatch: expected {expected}, component reports {found}")]
    VersionMismatch {
        expected: SpecVersion,
        found: SpecVersion,
    },

    /// Lock misuse (unlock by a non-owner, contended try-lock).
    #[error("not ready: {0}")]
    NotReady(String),

    /// The component refused a role or parameter value.
    #[error("unsupported setting: {0}")]
    UnsupportedSetting(String),

    /// Trailing guard bytes of an allocation were overwritten.
    #[error("memory guard corrupted in buffer {buffer_id} (alloc_len {alloc_len})")]
    GuardCorrupted { buffer_id: u32, alloc_len: usize },

    /// Unclassified OS-level failure.
    #[error("undefined error: {0}")]
    Undefined(String),
}

impl OmxError {
    /// Stable classification string reported for failed sessions.
    pub fn code(&self) -> &'static str {
        match self {
            OmxError::BadParameter(_) => "BadParameter",
            OmxError::InsufficientResources(_) => "InsufficientResources",
            OmxError::InvalidState { .. } => "InvalidState",
            OmxError::IncorrectStateTransition { .. } => "IncorrectStateTransition",
            OmxError::IncorrectStateOperation(_) => "IncorrectStateOperation",
            OmxError::Timeout { .. } | OmxError::EosTimeout { .. } => "Timeout",
            OmxError::StreamCorrupt(_) => "StreamCorrupt",
            OmxError::VersionMismatch { .. } => "VersionMismatch",
            OmxError::NotReady(_) => "NotReady",
            OmxError::UnsupportedSetting(_) => "UnsupportedSetting",
            OmxError::GuardCorrupted { .. } => "GuardCorrupted",
            OmxError::Undefined(_) => "Undefined",
        }
    }

    /// Errors after which the session must not attempt any further component calls.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OmxError::VersionMismatch { .. } | OmxError::GuardCorrupted { .. }
        )
    }
}

impl From<std::io::Error> for OmxError {
    fn from(err: std::io::Error) -> Self {
        OmxError::StreamCorrupt(err.to_string())
    }
}
