//! Drives a component through its lifecycle with bounded waits.

use std::sync::Arc;

use super::component::{Command, Component};
use super::core::{
    ComponentVersion, EXPECTED_SPEC_VERSION, LifecycleState, OmxError, OmxResult, SpecVersion,
};
use super::exchange::ExchangeEngine;
use super::osal::Event;

pub struct LifecycleController {
    session: usize,
    component: Arc<dyn Component>,
    state_changed: Arc<Event>,
    timeout_ms: u32,
    expected_version: SpecVersion,
}

impl LifecycleController {
    pub fn new(
        session: usize,
        component: Arc<dyn Component>,
        state_changed: Arc<Event>,
        timeout_ms: u32,
    ) -> Self {
        Self {
            session,
            component,
            state_changed,
            timeout_ms,
            expected_version: EXPECTED_SPEC_VERSION,
        }
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    /// Refuse to drive a component that speaks another interface version.
    pub fn check_version(&self) -> OmxResult<ComponentVersion> {
        let version = self.component.version()?;
        if version.spec != self.expected_version {
            tracing::error!(
                session = self.session,
                component = %version.name,
                expected = %self.expected_version,
                found = %version.spec,
                "interface version mismatch"
            );
            return Err(OmxError::VersionMismatch {
                expected: self.expected_version,
                found: version.spec,
            });
        }
        tracing::info!(
            session = self.session,
            component = %version.name,
            version = %version.component,
            spec = %version.spec,
            "component version"
        );
        Ok(version)
    }

    pub fn current_state(&self) -> OmxResult<LifecycleState> {
        self.component.get_state()
    }

    /// Issue a transition without waiting for it.
    ///
    /// The state-changed event is reset before the command goes out so a
    /// completion that races the caller's wait is not missed.
    pub fn request_state(&self, target: LifecycleState) -> OmxResult<()> {
        let current = self.component.get_state()?;
        if !current.can_transition_to(target) {
            return Err(OmxError::IncorrectStateTransition {
                from: current,
                to: target,
            });
        }
        tracing::info!(session = self.session, from = %current, to = %target, "requesting state");
        self.state_changed.reset()?;
        self.component.send_command(Command::StateSet(target))
    }

    pub fn wait_for_state(&self, target: LifecycleState, timeout_ms: u32) -> OmxResult<()> {
        if self.component.get_state()? == target {
            return Ok(());
        }
        if !self.state_changed.wait(timeout_ms)? {
            tracing::error!(session = self.session, %target, timeout_ms, "state wait timed out");
            return Err(OmxError::Timeout { target, timeout_ms });
        }
        let actual = self.component.get_state()?;
        if actual != target {
            return Err(OmxError::InvalidState {
                expected: target,
                actual,
            });
        }
        Ok(())
    }

    pub fn change_state_and_wait(&self, target: LifecycleState) -> OmxResult<()> {
        self.request_state(target)?;
        self.wait_for_state(target, self.timeout_ms)
    }

    /// Bring the component back to `Loaded`, free every buffer the session
    /// holds and release the component handle.
    ///
    /// Every step is attempted; the first error is returned.
    pub fn teardown(&self, exchange: &ExchangeEngine) -> OmxResult<()> {
        let mut first_error: Option<OmxError> = None;
        let mut note = |result: OmxResult<()>| {
            if let Err(e) = result {
                tracing::error!(session = self.session, error = %e, "teardown step failed");
                first_error.get_or_insert(e);
            }
        };

        let mut state = self.component.get_state()?;
        tracing::info!(session = self.session, %state, "tearing down");

        if state == LifecycleState::Invalid {
            self.discard_buffers(exchange);
            note(self.component.free_handle());
            return first_error.map_or(Ok(()), Err);
        }

        if matches!(state, LifecycleState::Executing | LifecycleState::Paused) {
            // Stop the output refill cycle before buffers start coming home.
            note(exchange.set_eos());
            note(self.change_state_and_wait(LifecycleState::Idle));
            state = self.component.get_state()?;
        }

        if state == LifecycleState::WaitingForResources {
            note(self.change_state_and_wait(LifecycleState::Loaded));
            state = self.component.get_state()?;
        }

        if state == LifecycleState::Idle {
            note(self.request_state(LifecycleState::Loaded));
            note(self.free_buffers(exchange));
            note(self.wait_for_state(LifecycleState::Loaded, self.timeout_ms));
        } else if state == LifecycleState::Loaded {
            // Allocation may have stopped halfway through Loaded -> Idle.
            note(self.free_buffers(exchange));
        } else {
            note(Err(OmxError::InvalidState {
                expected: LifecycleState::Loaded,
                actual: state,
            }));
            // Whatever the component could not take back is dropped here.
            self.discard_buffers(exchange);
        }

        note(self.component.free_handle());
        first_error.map_or(Ok(()), Err)
    }

    /// Drop the client-held buffers without handing them to the component.
    fn discard_buffers(&self, exchange: &ExchangeEngine) {
        match exchange.drain_all() {
            Ok(buffers) => {
                tracing::warn!(session = self.session, count = buffers.len(), "discarding buffers")
            }
            Err(e) => tracing::warn!(session = self.session, error = %e, "could not drain buffer queues"),
        }
    }

    fn free_buffers(&self, exchange: &ExchangeEngine) -> OmxResult<()> {
        let mut result = Ok(());
        let buffers = exchange.drain_all()?;
        tracing::debug!(session = self.session, count = buffers.len(), "freeing buffers");
        for buffer in buffers {
            if let Err(e) = self.component.free_buffer(buffer) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}
