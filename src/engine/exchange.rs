//! Buffer exchange between a session and its component.
//!
//! The completion callbacks run on component threads and touch the same
//! queues as the feed loop. Everything mutable lives in [`ExchangeState`]
//! behind one reentrant lock per session.

use std::cell::{RefCell, RefMut};
use std::io::Write;
use std::sync::Arc;

use super::component::{Command, Component, ComponentCallbacks, ComponentEvent, Rejected};
use super::core::{BufferHeader, INPUT_PORT, OUTPUT_PORT, OVERLAY_PORT, OmxError, OmxResult};
use super::osal::{Event, ReentrantMutex, ReentrantMutexGuard};
use super::queue::HandleQueue;
use super::source::{ClientMessage, FrameChannel};

/// Output bytes and frames observed by the exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    pub bytes_written: u64,
    pub frames_encoded: u64,
    pub codec_config_buffers: u64,
}

pub struct ExchangeState {
    pub input: HandleQueue<BufferHeader>,
    pub output: HandleQueue<BufferHeader>,
    pub overlay: HandleQueue<BufferHeader>,
    /// Buffers that came back while their queue was full.
    stranded: Vec<BufferHeader>,
    eos: bool,
    failure: Option<OmxError>,
    stats: ExchangeStats,
    sink: Box<dyn Write + Send>,
}

impl ExchangeState {
    fn queue_for_port(&mut self, port: u32) -> &mut HandleQueue<BufferHeader> {
        match port {
            OVERLAY_PORT => &mut self.overlay,
            OUTPUT_PORT => &mut self.output,
            _ => &mut self.input,
        }
    }

    pub fn eos(&self) -> bool {
        self.eos
    }
}

/// Queue sizes of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCapacities {
    pub input: usize,
    pub output: usize,
    pub overlay: usize,
}

pub struct ExchangeEngine {
    session: usize,
    state: ReentrantMutex<RefCell<ExchangeState>>,
    state_changed: Arc<Event>,
    remote: Option<Arc<dyn FrameChannel>>,
}

impl ExchangeEngine {
    pub fn new(
        session: usize,
        capacities: QueueCapacities,
        sink: Box<dyn Write + Send>,
        state_changed: Arc<Event>,
        remote: Option<Arc<dyn FrameChannel>>,
    ) -> OmxResult<Self> {
        let state = ExchangeState {
            input: HandleQueue::new(capacities.input)?,
            output: HandleQueue::new(capacities.output)?,
            overlay: HandleQueue::new(capacities.overlay)?,
            stranded: Vec::new(),
            eos: false,
            failure: None,
            stats: ExchangeStats::default(),
            sink,
        };
        Ok(Self {
            session,
            state: ReentrantMutex::new(RefCell::new(state)),
            state_changed,
            remote,
        })
    }

    pub fn session(&self) -> usize {
        self.session
    }

    /// Take the session lock. Borrow the state through the guard only for
    /// as long as no component call is in flight.
    pub fn lock(&self) -> OmxResult<ReentrantMutexGuard<'_, RefCell<ExchangeState>>> {
        self.state.lock()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ExchangeState) -> R) -> OmxResult<R> {
        let guard = self.lock()?;
        let mut state = borrow(&guard)?;
        Ok(f(&mut state))
    }

    pub fn pop_input(&self) -> OmxResult<Option<BufferHeader>> {
        self.with_state(|s| s.input.pop())
    }

    pub fn pop_overlay(&self) -> OmxResult<Option<BufferHeader>> {
        self.with_state(|s| s.overlay.pop())
    }

    pub fn pop_output(&self) -> OmxResult<Option<BufferHeader>> {
        self.with_state(|s| s.output.pop())
    }

    /// Put a client-owned buffer back on the queue of its port.
    pub fn requeue(&self, buffer: BufferHeader) -> OmxResult<()> {
        self.with_state(|s| {
            let port = buffer.port();
            if let Err(buffer) = s.queue_for_port(port).push(buffer) {
                s.stranded.push(buffer);
                return Err(OmxError::InsufficientResources(format!(
                    "queue for port {} is full",
                    port
                )));
            }
            Ok(())
        })?
    }

    pub fn available(&self, port: u32) -> OmxResult<usize> {
        self.with_state(|s| s.queue_for_port(port).available())
    }

    /// Set the end-of-stream flag. Once set it never clears.
    pub fn set_eos(&self) -> OmxResult<()> {
        self.with_state(|s| s.eos = true)
    }

    pub fn is_eos(&self) -> OmxResult<bool> {
        self.with_state(|s| s.eos)
    }

    /// First error reported by the component, if any.
    pub fn failure(&self) -> OmxResult<Option<OmxError>> {
        self.with_state(|s| s.failure.clone())
    }

    pub fn stats(&self) -> OmxResult<ExchangeStats> {
        self.with_state(|s| s.stats)
    }

    /// Take every client-owned buffer out of the session, stranded ones included.
    pub fn drain_all(&self) -> OmxResult<Vec<BufferHeader>> {
        self.with_state(|s| {
            let mut all = s.input.drain();
            all.extend(s.output.drain());
            all.extend(s.overlay.drain());
            all.append(&mut s.stranded);
            all
        })
    }

    /// A consumed input or overlay buffer is back with the client.
    pub fn input_returned(&self, mut buffer: BufferHeader) -> OmxResult<()> {
        let frame = buffer.external.take();
        let port = buffer.port();
        tracing::debug!(session = self.session, port, id = buffer.id(), "input returned");

        {
            let guard = self.lock()?;
            let mut state = borrow(&guard)?;
            if let Err(buffer) = state.queue_for_port(port).push(buffer) {
                state.stranded.push(buffer);
                return Err(OmxError::InsufficientResources(format!(
                    "session {}: return queue for port {} overflowed",
                    self.session, port
                )));
            }
        }

        if port == INPUT_PORT {
            if let (Some(channel), Some(frame)) = (&self.remote, frame) {
                channel.send(ClientMessage::Ack {
                    frame_id: frame.frame_id,
                })?;
            }
        }
        Ok(())
    }

    /// A filled output buffer is back with the client.
    pub fn output_filled(&self, component: &dyn Component, mut buffer: BufferHeader) -> OmxResult<()> {
        let guard = self.lock()?;
        {
            let mut state = borrow(&guard)?;
            if state.eos {
                return push_output(&mut state, buffer, self.session);
            }

            if buffer.filled_len > 0 {
                let payload = buffer.payload();
                state.sink.write_all(payload)?;
                state.sink.flush()?;
                state.stats.bytes_written += payload.len() as u64;
                if buffer.is_codec_config() {
                    state.stats.codec_config_buffers += 1;
                } else {
                    state.stats.frames_encoded += 1;
                }
                tracing::debug!(
                    session = self.session,
                    id = buffer.id(),
                    len = payload.len(),
                    flags = buffer.flags.bits(),
                    "output written"
                );
            }

            if buffer.is_eos() {
                tracing::info!(session = self.session, "end of stream on output");
                state.eos = true;
                return push_output(&mut state, buffer, self.session);
            }
        }

        buffer.reset();
        match component.fill_this_buffer(buffer) {
            Ok(()) => Ok(()),
            Err(Rejected { error, buffer }) => {
                tracing::error!(session = self.session, %error, "output resubmission refused");
                let mut state = borrow(&guard)?;
                push_output(&mut state, buffer, self.session)?;
                Err(error)
            }
        }
    }

    /// Component event notification.
    pub fn handle_event(&self, event: ComponentEvent) -> OmxResult<()> {
        match event {
            ComponentEvent::CmdComplete(Command::StateSet(state)) => {
                tracing::info!(session = self.session, %state, "state transition complete");
                self.state_changed.signal()
            }
            ComponentEvent::CmdComplete(command) => {
                tracing::debug!(session = self.session, ?command, "command complete");
                Ok(())
            }
            ComponentEvent::BufferFlag { port, flags } => {
                tracing::debug!(session = self.session, port, flags, "buffer flag");
                self.set_eos()
            }
            ComponentEvent::Error(error) => {
                tracing::error!(session = self.session, %error, "component reported an error");
                self.with_state(|s| {
                    s.eos = true;
                    s.failure.get_or_insert_with(|| error.clone());
                })?;
                // Wake a pending state wait; it re-queries the real state.
                self.state_changed.signal()?;
                Err(error)
            }
        }
    }
}

fn borrow<'a>(cell: &'a RefCell<ExchangeState>) -> OmxResult<RefMut<'a, ExchangeState>> {
    cell.try_borrow_mut()
        .map_err(|_| OmxError::NotReady("session state already borrowed".to_string()))
}

fn push_output(state: &mut ExchangeState, buffer: BufferHeader, session: usize) -> OmxResult<()> {
    if let Err(buffer) = state.output.push(buffer) {
        state.stranded.push(buffer);
        return Err(OmxError::InsufficientResources(format!(
            "session {}: output return queue overflowed",
            session
        )));
    }
    Ok(())
}

impl ComponentCallbacks for ExchangeEngine {
    fn on_event(&self, _component: &dyn Component, event: ComponentEvent) -> OmxResult<()> {
        self.handle_event(event)
    }

    fn empty_buffer_done(&self, _component: &dyn Component, buffer: BufferHeader) -> OmxResult<()> {
        self.input_returned(buffer)
    }

    fn fill_buffer_done(&self, component: &dyn Component, buffer: BufferHeader) -> OmxResult<()> {
        self.output_filled(component, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::core::{BufferFlags, ComponentVersion, EXPECTED_SPEC_VERSION, LifecycleState};
    use crate::engine::component::{Param, ParamIndex, SubmitResult};
    use crate::engine::osal::GuardedMemory;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Records resubmitted output buffers; optionally refuses them.
    #[derive(Default)]
    struct RecordingComponent {
        refilled: Mutex<Vec<u32>>,
        refuse: bool,
    }

    impl Component for RecordingComponent {
        fn name(&self) -> &str {
            "recording"
        }
        fn version(&self) -> OmxResult<ComponentVersion> {
            Ok(ComponentVersion {
                name: "recording".into(),
                component: EXPECTED_SPEC_VERSION,
                spec: EXPECTED_SPEC_VERSION,
            })
        }
        fn set_callbacks(&self, _: Arc<dyn ComponentCallbacks>) -> OmxResult<()> {
            Ok(())
        }
        fn send_command(&self, _: Command) -> OmxResult<()> {
            Ok(())
        }
        fn get_state(&self) -> OmxResult<LifecycleState> {
            Ok(LifecycleState::Executing)
        }
        fn get_parameter(&self, _: ParamIndex) -> OmxResult<Param> {
            Err(OmxError::UnsupportedSetting("none".into()))
        }
        fn set_parameter(&self, _: Param) -> OmxResult<()> {
            Ok(())
        }
        fn allocate_buffer(&self, port: u32, size: usize) -> OmxResult<BufferHeader> {
            Ok(BufferHeader::new(0, port, GuardedMemory::allocate(size)?))
        }
        fn free_buffer(&self, buffer: BufferHeader) -> OmxResult<()> {
            let id = buffer.id();
            buffer.into_memory().release(id)
        }
        fn empty_this_buffer(&self, _: BufferHeader) -> SubmitResult {
            Ok(())
        }
        fn fill_this_buffer(&self, buffer: BufferHeader) -> SubmitResult {
            if self.refuse {
                return Err(Rejected {
                    error: OmxError::IncorrectStateOperation("refused".into()),
                    buffer,
                });
            }
            assert_eq!(buffer.filled_len, 0, "resubmitted buffer must be cleared");
            self.refilled.lock().unwrap().push(buffer.id());
            Ok(())
        }
        fn free_handle(&self) -> OmxResult<()> {
            Ok(())
        }
    }

    fn engine(sink: SharedSink) -> ExchangeEngine {
        ExchangeEngine::new(
            0,
            QueueCapacities {
                input: 2,
                output: 2,
                overlay: 1,
            },
            Box::new(sink),
            Arc::new(Event::new()),
            None,
        )
        .unwrap()
    }

    fn output(id: u32, payload: &[u8], flags: BufferFlags) -> BufferHeader {
        let mut buf = BufferHeader::new(id, OUTPUT_PORT, GuardedMemory::allocate(16).unwrap());
        buf.data_mut()[..payload.len()].copy_from_slice(payload);
        buf.filled_len = payload.len();
        buf.flags = flags;
        buf
    }

    #[test]
    fn filled_output_is_written_and_recycled() {
        let sink = SharedSink::default();
        let exchange = engine(sink.clone());
        let component = RecordingComponent::default();

        exchange
            .output_filled(&component, output(1, b"cfg", BufferFlags::CODEC_CONFIG))
            .unwrap();
        exchange
            .output_filled(&component, output(2, b"frame", BufferFlags::empty()))
            .unwrap();

        assert_eq!(&*sink.0.lock().unwrap(), b"cfgframe");
        assert_eq!(*component.refilled.lock().unwrap(), vec![1, 2]);
        let stats = exchange.stats().unwrap();
        assert_eq!(stats.bytes_written, 8);
        assert_eq!(stats.frames_encoded, 1, "codec config is not a frame");
        assert_eq!(stats.codec_config_buffers, 1);
    }

    #[test]
    fn eos_output_stops_recycling_and_further_writes() {
        let sink = SharedSink::default();
        let exchange = engine(sink.clone());
        let component = RecordingComponent::default();

        exchange
            .output_filled(&component, output(1, b"last", BufferFlags::EOS))
            .unwrap();
        assert!(exchange.is_eos().unwrap());

        exchange
            .output_filled(&component, output(2, b"late", BufferFlags::empty()))
            .unwrap();

        assert_eq!(&*sink.0.lock().unwrap(), b"last");
        assert!(component.refilled.lock().unwrap().is_empty());
        assert_eq!(exchange.available(OUTPUT_PORT).unwrap(), 2);
    }

    #[test]
    fn refused_resubmission_keeps_the_buffer() {
        let exchange = engine(SharedSink::default());
        let component = RecordingComponent {
            refuse: true,
            ..Default::default()
        };

        let err = exchange
            .output_filled(&component, output(5, b"x", BufferFlags::empty()))
            .unwrap_err();
        assert_eq!(err.code(), "IncorrectStateOperation");
        let back = exchange.pop_output().unwrap().expect("buffer requeued");
        assert_eq!(back.id(), 5);
    }

    #[test]
    fn returned_inputs_go_to_the_queue_of_their_port() {
        let exchange = engine(SharedSink::default());
        let input = BufferHeader::new(1, INPUT_PORT, GuardedMemory::allocate(8).unwrap());
        let overlay = BufferHeader::new(2, OVERLAY_PORT, GuardedMemory::allocate(8).unwrap());

        exchange.input_returned(input).unwrap();
        exchange.input_returned(overlay).unwrap();

        assert_eq!(exchange.available(INPUT_PORT).unwrap(), 1);
        assert_eq!(exchange.available(OVERLAY_PORT).unwrap(), 1);
        assert_eq!(exchange.pop_overlay().unwrap().map(|b| b.id()), Some(2));
    }

    #[test]
    fn overflowing_return_queue_is_a_resource_error() {
        let exchange = engine(SharedSink::default());
        for id in 0..2 {
            let buf = BufferHeader::new(id, INPUT_PORT, GuardedMemory::allocate(8).unwrap());
            exchange.input_returned(buf).unwrap();
        }
        let extra = BufferHeader::new(9, INPUT_PORT, GuardedMemory::allocate(8).unwrap());
        let err = exchange.input_returned(extra).unwrap_err();
        assert_eq!(err.code(), "InsufficientResources");
        assert_eq!(exchange.drain_all().unwrap().len(), 3, "no buffer is lost");
    }

    #[test]
    fn state_set_completion_signals_the_event() {
        let event = Arc::new(Event::new());
        let exchange = ExchangeEngine::new(
            1,
            QueueCapacities {
                input: 1,
                output: 1,
                overlay: 0,
            },
            Box::new(std::io::sink()),
            Arc::clone(&event),
            None,
        )
        .unwrap();

        exchange
            .handle_event(ComponentEvent::CmdComplete(Command::PortDisable(2)))
            .unwrap();
        assert!(!event.is_signaled().unwrap());

        exchange
            .handle_event(ComponentEvent::CmdComplete(Command::StateSet(
                LifecycleState::Idle,
            )))
            .unwrap();
        assert!(event.is_signaled().unwrap());

        let err = exchange
            .handle_event(ComponentEvent::Error(OmxError::Undefined("hw".into())))
            .unwrap_err();
        assert_eq!(err.code(), "Undefined");
        assert!(exchange.is_eos().unwrap());
        assert_eq!(exchange.failure().unwrap(), Some(OmxError::Undefined("hw".into())));
    }
}
