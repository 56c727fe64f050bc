//! In-process encoder component.
//!
//! Behaves like an asynchronous hardware encoder as far as the client can
//! tell: commands and buffers are queued to a worker thread, which completes
//! them and calls back from that thread. The "bitstream" is a codec-config
//! header followed by one fixed-size record per input frame.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SendError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

use rand::Rng;

use super::component::{
    Command, Component, ComponentCallbacks, ComponentEvent, Param, ParamIndex, Rejected,
    SubmitResult,
};
use super::core::{
    AvcExtension, BufferFlags, BufferHeader, CodingType, ColorFormat, ComponentVersion, Direction,
    EXPECTED_SPEC_VERSION, FrameRate, HEVC_PROFILE_MAIN, INPUT_PORT, LifecycleState, MAX_QP,
    OUTPUT_PORT, OVERLAY_PORT, OmxError, OmxResult, PortDefinition, PortDomain, PortFormat,
    PortRange, SpecVersion, VideoCoding,
};
use super::osal::{GuardedMemory, OsalThread, ThreadPriority};

pub const SIM_COMPONENT_NAME: &str = "OMX.sim.video.encoder";

/// Magic of the codec-config header.
pub const CONFIG_MAGIC: &[u8; 4] = b"SIMC";
/// Magic of a per-frame record.
pub const FRAME_MAGIC: &[u8; 4] = b"SIMF";
/// magic, sequence (u32 LE), input length (u32 LE), FNV-1a 64 of the input (u64 LE).
pub const FRAME_RECORD_LEN: usize = 20;

const MIN_OUTPUT_BUFFER: usize = 4096;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub name: String,
    pub component_version: SpecVersion,
    /// Interface version reported to the client.
    pub spec_version: SpecVersion,
    /// Fixed processing delay per input buffer.
    pub latency: Duration,
    /// Extra random delay per input buffer, up to this many microseconds.
    pub jitter_us: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            name: SIM_COMPONENT_NAME.to_string(),
            component_version: SpecVersion::new(1, 0, 0, 0),
            spec_version: EXPECTED_SPEC_VERSION,
            latency: Duration::ZERO,
            jitter_us: 0,
        }
    }
}

/// Instantiate a component by name.
pub fn get_handle(name: &str, config: SimConfig) -> OmxResult<Arc<SimulatedEncoder>> {
    if !name.starts_with("OMX.sim.") {
        return Err(OmxError::BadParameter(format!("no component named '{}'", name)));
    }
    SimulatedEncoder::new(SimConfig {
        name: name.to_string(),
        ..config
    })
}

enum Job {
    Command(Command),
    CheckTransition,
    Empty(BufferHeader),
    Fill(BufferHeader),
    Fault(LifecycleState),
}

/// Encoder settings of the output port, answered and stored per parameter.
#[derive(Debug, Clone, Copy)]
struct CodecState {
    avc: VideoCoding,
    hevc: VideoCoding,
    extension: AvcExtension,
    deblocking: bool,
    qp_i: u32,
    quality: u32,
}

impl Default for CodecState {
    fn default() -> Self {
        let avc = VideoCoding {
            port: OUTPUT_PORT,
            profile: 0x01,
            level: 40,
            p_frames: 29,
            ref_frames: 1,
            cabac: false,
        };
        Self {
            avc,
            hevc: VideoCoding {
                profile: HEVC_PROFILE_MAIN,
                level: 93,
                ..avc
            },
            extension: AvcExtension {
                port: OUTPUT_PORT,
                cpb_size: 0,
                preset: 0,
                intra_qp_delta: 0,
                qp_min_i: 0,
                qp_max_i: MAX_QP,
                qp_min_pb: 0,
                qp_max_pb: MAX_QP,
            },
            deblocking: false,
            qp_i: 26,
            quality: 80,
        }
    }
}

struct SimState {
    state: LifecycleState,
    pending: Option<LifecycleState>,
    role: CodingType,
    ports: Vec<PortDefinition>,
    allocated: [u32; 3],
    next_id: u32,
    inputs: VecDeque<BufferHeader>,
    outputs: VecDeque<BufferHeader>,
    sequence: u32,
    config_sent: bool,
    codec: CodecState,
}

impl SimState {
    fn port_count(&self) -> u32 {
        if self.role.is_image() { 2 } else { 3 }
    }

    fn port(&self, index: u32) -> OmxResult<&PortDefinition> {
        if index >= self.port_count() {
            return Err(OmxError::BadParameter(format!("no port {}", index)));
        }
        Ok(&self.ports[index as usize])
    }

    fn populated(&self) -> bool {
        (0..self.port_count() as usize).all(|i| {
            !self.ports[i].enabled || self.allocated[i] >= self.ports[i].buffer_count_actual
        })
    }

    fn unpopulated(&self) -> bool {
        self.allocated.iter().all(|n| *n == 0)
    }

    fn is_streaming(&self) -> bool {
        matches!(self.state, LifecycleState::Executing | LifecycleState::Paused)
    }

    /// Encoder settings live on the output port and only while the role
    /// uses them.
    fn codec_port(&self, port: u32, coding: &[CodingType]) -> OmxResult<()> {
        if port != OUTPUT_PORT {
            return Err(OmxError::BadParameter(format!(
                "encoder settings on port {}",
                port
            )));
        }
        if !coding.contains(&self.role) {
            return Err(OmxError::UnsupportedSetting(format!(
                "setting not available to {:?}",
                self.role
            )));
        }
        Ok(())
    }

    /// Stream layout settings are frozen once buffers exist.
    fn codec_settable(&self, port: u32, coding: &[CodingType]) -> OmxResult<()> {
        self.codec_port(port, coding)?;
        if self.state != LifecycleState::Loaded {
            return Err(OmxError::IncorrectStateOperation(format!(
                "encoder settings changed in state {}",
                self.state
            )));
        }
        Ok(())
    }
}

const VIDEO: &[CodingType] = &[CodingType::Avc, CodingType::Hevc];

fn default_ports() -> Vec<PortDefinition> {
    let video = |index, direction, color, coding, width, height, count| PortDefinition {
        index,
        direction,
        domain: PortDomain::Video,
        enabled: true,
        populated: false,
        buffer_count_min: 1,
        buffer_count_actual: count,
        buffer_size: 0,
        buffer_alignment: 16,
        format: PortFormat {
            width,
            height,
            stride: width,
            slice_height: height,
            color,
            coding,
            bitrate: 0,
            framerate_q16: FrameRate::new(30, 1).to_q16(),
        },
    };
    let mut ports = vec![
        video(INPUT_PORT, Direction::Input, ColorFormat::Yuv420Planar, CodingType::Unused, 176, 144, 4),
        video(OUTPUT_PORT, Direction::Output, ColorFormat::Unused, CodingType::Avc, 176, 144, 4),
        video(OVERLAY_PORT, Direction::Input, ColorFormat::Argb8888, CodingType::Unused, 16, 16, 2),
    ];
    ports[OUTPUT_PORT as usize].format.bitrate = 64_000;
    for port in &mut ports {
        port.buffer_size = required_buffer_size(port);
    }
    ports
}

fn required_buffer_size(port: &PortDefinition) -> usize {
    match port.direction {
        Direction::Output => MIN_OUTPUT_BUFFER,
        Direction::Input => {
            let f = &port.format;
            let rows = f.slice_height.max(f.height);
            f.color.frame_size(f.stride.max(f.width), rows).unwrap_or(0)
        }
    }
}

/// FNV-1a, 64 bit.
pub fn fnv1a64(data: &[u8]) -> u64 {
    data.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

pub struct SimulatedEncoder {
    config: SimConfig,
    state: Mutex<SimState>,
    jobs: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<OsalThread<()>>>,
    callbacks: Mutex<Option<Arc<dyn ComponentCallbacks>>>,
    released: AtomicBool,
}

impl SimulatedEncoder {
    pub fn new(config: SimConfig) -> OmxResult<Arc<Self>> {
        let (tx, rx) = mpsc::channel();
        let sim = Arc::new(Self {
            config,
            state: Mutex::new(SimState {
                state: LifecycleState::Loaded,
                pending: None,
                role: CodingType::Avc,
                ports: default_ports(),
                allocated: [0; 3],
                next_id: 1,
                inputs: VecDeque::new(),
                outputs: VecDeque::new(),
                sequence: 0,
                config_sent: false,
                codec: CodecState::default(),
            }),
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(None),
            callbacks: Mutex::new(None),
            released: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&sim);
        let worker = OsalThread::spawn("sim-encoder", ThreadPriority::default(), move || {
            run_worker(weak, rx)
        })?;
        *sim.worker.lock().map_err(poisoned)? = Some(worker);
        Ok(sim)
    }

    /// Simulate an unrecoverable hardware failure.
    pub fn inject_fault(&self) {
        let previous = match self.state.lock() {
            Ok(mut st) => std::mem::replace(&mut st.state, LifecycleState::Invalid),
            Err(_) => return,
        };
        let _ = self.post(Job::Fault(previous));
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Buffers currently held by the component.
    pub fn held_buffers(&self) -> usize {
        self.state
            .lock()
            .map(|st| st.inputs.len() + st.outputs.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> OmxResult<MutexGuard<'_, SimState>> {
        self.state.lock().map_err(poisoned)
    }

    fn post(&self, job: Job) -> Result<(), Job> {
        let jobs = match self.jobs.lock() {
            Ok(jobs) => jobs,
            Err(_) => return Err(job),
        };
        match jobs.as_ref() {
            Some(tx) => tx.send(job).map_err(|SendError(job)| job),
            None => Err(job),
        }
    }

    fn post_or_fail(&self, job: Job) -> OmxResult<()> {
        self.post(job)
            .map_err(|_| OmxError::IncorrectStateOperation("component handle released".to_string()))
    }

    fn ensure_live(&self) -> OmxResult<()> {
        if self.is_released() {
            return Err(OmxError::BadParameter("component handle released".to_string()));
        }
        Ok(())
    }

    fn callbacks(&self) -> Option<Arc<dyn ComponentCallbacks>> {
        self.callbacks.lock().ok().and_then(|cb| cb.clone())
    }

    fn submit(&self, buffer: BufferHeader, output: bool) -> SubmitResult {
        let refuse = |error: OmxError, buffer: BufferHeader| Err(Rejected { error, buffer });

        if self.is_released() {
            return refuse(OmxError::BadParameter("component handle released".to_string()), buffer);
        }
        {
            let st = match self.lock() {
                Ok(st) => st,
                Err(error) => return refuse(error, buffer),
            };
            if !st.is_streaming() {
                let error = OmxError::IncorrectStateOperation(format!(
                    "buffer submitted in state {}",
                    st.state
                ));
                return refuse(error, buffer);
            }
            let port_ok = if output {
                buffer.port() == OUTPUT_PORT
            } else {
                buffer.port() == INPUT_PORT
                    || (buffer.port() == OVERLAY_PORT && st.port_count() > OVERLAY_PORT)
            };
            if !port_ok {
                let error = OmxError::BadParameter(format!("buffer for port {}", buffer.port()));
                return refuse(error, buffer);
            }
            if buffer.offset + buffer.filled_len > buffer.alloc_len() {
                let error = OmxError::BadParameter(format!(
                    "payload {}+{} exceeds buffer of {}",
                    buffer.offset,
                    buffer.filled_len,
                    buffer.alloc_len()
                ));
                return refuse(error, buffer);
            }
        }

        let job = if output { Job::Fill(buffer) } else { Job::Empty(buffer) };
        self.post(job).map_err(|job| {
            let (Job::Fill(buffer) | Job::Empty(buffer)) = job else {
                unreachable!("only buffer jobs are submitted here")
            };
            Rejected {
                error: OmxError::IncorrectStateOperation("component handle released".to_string()),
                buffer,
            }
        })
    }

    // ------------------------------------------------------------------
    // Worker side
    // ------------------------------------------------------------------

    fn notify(&self, event: ComponentEvent) {
        if let Some(cb) = self.callbacks() {
            if let Err(e) = cb.on_event(self, event) {
                tracing::debug!(component = %self.config.name, error = %e, "event callback failed");
            }
        }
    }

    fn return_input(&self, buffer: BufferHeader) {
        if let Some(cb) = self.callbacks() {
            if let Err(e) = cb.empty_buffer_done(self, buffer) {
                tracing::warn!(component = %self.config.name, error = %e, "empty_buffer_done failed");
            }
        }
    }

    fn return_output(&self, buffer: BufferHeader) {
        if let Some(cb) = self.callbacks() {
            if let Err(e) = cb.fill_buffer_done(self, buffer) {
                tracing::warn!(component = %self.config.name, error = %e, "fill_buffer_done failed");
            }
        }
    }

    fn handle_command(&self, command: Command) -> OmxResult<()> {
        match command {
            Command::StateSet(target) => self.handle_state_set(target),
            Command::PortDisable(port) | Command::PortEnable(port) => {
                {
                    let mut st = self.lock()?;
                    st.port(port)?;
                    st.ports[port as usize].enabled = matches!(command, Command::PortEnable(_));
                }
                self.notify(ComponentEvent::CmdComplete(command));
                Ok(())
            }
        }
    }

    fn handle_state_set(&self, target: LifecycleState) -> OmxResult<()> {
        let current = self.lock()?.state;
        if current == target {
            self.notify(ComponentEvent::Error(OmxError::IncorrectStateOperation(format!(
                "already in state {}",
                target
            ))));
            return Ok(());
        }
        if !current.can_transition_to(target) {
            self.notify(ComponentEvent::Error(OmxError::IncorrectStateTransition {
                from: current,
                to: target,
            }));
            return Ok(());
        }

        use LifecycleState::*;
        match (current, target) {
            (Loaded, Idle) | (Idle, Loaded) => {
                self.lock()?.pending.get_or_insert(target);
                self.check_transition()
            }
            (Executing, Idle) | (Paused, Idle) => {
                let (inputs, outputs) = {
                    let mut st = self.lock()?;
                    st.state = Idle;
                    let inputs: Vec<_> = st.inputs.drain(..).collect();
                    let outputs: Vec<_> = st.outputs.drain(..).collect();
                    (inputs, outputs)
                };
                for buffer in inputs {
                    self.return_input(buffer);
                }
                for mut buffer in outputs {
                    buffer.reset();
                    self.return_output(buffer);
                }
                self.notify(ComponentEvent::CmdComplete(Command::StateSet(Idle)));
                Ok(())
            }
            _ => {
                self.lock()?.state = target;
                self.notify(ComponentEvent::CmdComplete(Command::StateSet(target)));
                if target == Executing {
                    self.process()?;
                }
                Ok(())
            }
        }
    }

    fn check_transition(&self) -> OmxResult<()> {
        let completed = {
            let mut st = self.lock()?;
            let done = match st.pending {
                Some(LifecycleState::Idle) => st.populated(),
                Some(LifecycleState::Loaded) => st.unpopulated(),
                _ => false,
            };
            if done {
                let target = st.pending.take();
                if let Some(target) = target {
                    st.state = target;
                    if target == LifecycleState::Loaded {
                        st.config_sent = false;
                        st.sequence = 0;
                    }
                }
                target
            } else {
                None
            }
        };
        if let Some(target) = completed {
            self.notify(ComponentEvent::CmdComplete(Command::StateSet(target)));
        }
        Ok(())
    }

    fn delay(&self) {
        let mut delay = self.config.latency;
        if self.config.jitter_us > 0 {
            let jitter = rand::thread_rng().gen_range(0..=self.config.jitter_us);
            delay += Duration::from_micros(jitter);
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    /// Encode as many held inputs as there are held outputs.
    fn process(&self) -> OmxResult<()> {
        loop {
            let work = {
                let mut st = self.lock()?;
                if st.state != LifecycleState::Executing || st.outputs.is_empty() {
                    None
                } else if !st.config_sent {
                    st.config_sent = true;
                    let mut out = st.outputs.pop_front();
                    if let Some(out) = out.as_mut() {
                        let f = &st.ports[INPUT_PORT as usize].format;
                        let header = ConfigHeader {
                            role: st.role,
                            width: f.width,
                            height: f.height,
                            codec: st.codec,
                        };
                        write_config(out, &header);
                    }
                    out.map(|out| (None, out))
                } else if let Some(input) = st.inputs.pop_front() {
                    let out = st.outputs.pop_front();
                    let sequence = st.sequence;
                    st.sequence = st.sequence.wrapping_add(1);
                    out.map(|mut out| {
                        write_frame(&mut out, &input, sequence);
                        (Some(input), out)
                    })
                } else {
                    None
                }
            };

            let Some((input, output)) = work else {
                return Ok(());
            };
            let eos = output.is_eos();
            if let Some(input) = input {
                self.delay();
                self.return_input(input);
            }
            self.return_output(output);
            if eos {
                self.notify(ComponentEvent::BufferFlag {
                    port: OUTPUT_PORT,
                    flags: BufferFlags::EOS.bits(),
                });
            }
        }
    }

    fn handle_job(&self, job: Job) -> OmxResult<()> {
        match job {
            Job::Command(command) => self.handle_command(command),
            Job::CheckTransition => self.check_transition(),
            Job::Empty(buffer) => {
                if buffer.port() == OVERLAY_PORT {
                    // Overlay pictures are consumed as soon as they arrive.
                    self.return_input(buffer);
                    return Ok(());
                }
                self.lock()?.inputs.push_back(buffer);
                self.process()
            }
            Job::Fill(buffer) => {
                self.lock()?.outputs.push_back(buffer);
                self.process()
            }
            Job::Fault(previous) => {
                tracing::warn!(component = %self.config.name, "hardware fault injected");
                self.notify(ComponentEvent::Error(OmxError::InvalidState {
                    expected: previous,
                    actual: LifecycleState::Invalid,
                }));
                Ok(())
            }
        }
    }
}

struct ConfigHeader {
    role: CodingType,
    width: u32,
    height: u32,
    codec: CodecState,
}

impl ConfigHeader {
    /// Profile and level for video; quality and zero for JPEG.
    fn coding_words(&self) -> [u32; 2] {
        match self.role {
            CodingType::Avc => [self.codec.avc.profile, self.codec.avc.level],
            CodingType::Hevc => [self.codec.hevc.profile, self.codec.hevc.level],
            _ => [self.codec.quality, 0],
        }
    }
}

/// magic, role, width, height, then the two coding words (all u32 LE).
fn write_config(out: &mut BufferHeader, header: &ConfigHeader) {
    let role = header.role.role().unwrap_or("").as_bytes();
    let mut bytes = Vec::with_capacity(4 + role.len() + 16);
    bytes.extend_from_slice(CONFIG_MAGIC);
    bytes.extend_from_slice(role);
    bytes.extend_from_slice(&header.width.to_le_bytes());
    bytes.extend_from_slice(&header.height.to_le_bytes());
    for word in header.coding_words() {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    let n = bytes.len().min(out.alloc_len());
    out.data_mut()[..n].copy_from_slice(&bytes[..n]);
    out.offset = 0;
    out.filled_len = n;
    out.flags = BufferFlags::CODEC_CONFIG;
}

fn write_frame(out: &mut BufferHeader, input: &BufferHeader, sequence: u32) {
    out.offset = 0;
    out.flags = BufferFlags::empty();
    out.filled_len = 0;
    if input.filled_len > 0 {
        let payload = input.payload();
        let mut record = [0u8; FRAME_RECORD_LEN];
        record[..4].copy_from_slice(FRAME_MAGIC);
        record[4..8].copy_from_slice(&sequence.to_le_bytes());
        record[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        record[12..20].copy_from_slice(&fnv1a64(payload).to_le_bytes());
        let n = record.len().min(out.alloc_len());
        out.data_mut()[..n].copy_from_slice(&record[..n]);
        out.filled_len = n;
    }
    if input.is_eos() {
        out.flags.insert(BufferFlags::EOS);
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> OmxError {
    OmxError::Undefined("component state poisoned".to_string())
}

fn run_worker(sim: Weak<SimulatedEncoder>, jobs: Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        let Some(sim) = sim.upgrade() else {
            break;
        };
        if let Err(e) = sim.handle_job(job) {
            tracing::warn!(component = %sim.config.name, error = %e, "job failed");
            sim.notify(ComponentEvent::Error(e));
        }
    }
}

impl Component for SimulatedEncoder {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn version(&self) -> OmxResult<ComponentVersion> {
        self.ensure_live()?;
        Ok(ComponentVersion {
            name: self.config.name.clone(),
            component: self.config.component_version,
            spec: self.config.spec_version,
        })
    }

    fn set_callbacks(&self, callbacks: Arc<dyn ComponentCallbacks>) -> OmxResult<()> {
        self.ensure_live()?;
        *self.callbacks.lock().map_err(poisoned)? = Some(callbacks);
        Ok(())
    }

    fn send_command(&self, command: Command) -> OmxResult<()> {
        self.ensure_live()?;
        if self.callbacks().is_none() {
            return Err(OmxError::BadParameter("no callbacks registered".to_string()));
        }
        {
            let mut st = self.lock()?;
            if st.state == LifecycleState::Invalid {
                return Err(OmxError::InvalidState {
                    expected: LifecycleState::Loaded,
                    actual: LifecycleState::Invalid,
                });
            }
            // Buffer (de)allocation is legal as soon as these are accepted.
            if let Command::StateSet(target) = command {
                let populating = matches!(
                    (st.state, target),
                    (LifecycleState::Loaded, LifecycleState::Idle)
                        | (LifecycleState::Idle, LifecycleState::Loaded)
                );
                if populating && st.pending.is_none() {
                    st.pending = Some(target);
                }
            }
        }
        self.post_or_fail(Job::Command(command))
    }

    fn get_state(&self) -> OmxResult<LifecycleState> {
        self.ensure_live()?;
        Ok(self.lock()?.state)
    }

    fn get_parameter(&self, index: ParamIndex) -> OmxResult<Param> {
        self.ensure_live()?;
        let st = self.lock()?;
        match index {
            ParamIndex::PortDefinition(port) => {
                let mut def = st.port(port)?.clone();
                def.populated = st.allocated[port as usize] >= def.buffer_count_actual;
                Ok(Param::PortDefinition(def))
            }
            ParamIndex::VideoInit => Ok(Param::VideoInit(PortRange {
                start: 0,
                count: if st.role.is_image() { 0 } else { 3 },
            })),
            ParamIndex::ImageInit => Ok(Param::ImageInit(PortRange {
                start: 0,
                count: if st.role.is_image() { 2 } else { 0 },
            })),
            ParamIndex::StandardComponentRole => Ok(Param::StandardComponentRole(
                st.role.role().unwrap_or_default().to_string(),
            )),
            ParamIndex::VideoBitrate(port) => Ok(Param::VideoBitrate {
                port,
                target_bps: st.port(port)?.format.bitrate,
            }),
            ParamIndex::VideoAvc(port) => {
                st.codec_port(port, &[CodingType::Avc])?;
                Ok(Param::VideoAvc(st.codec.avc))
            }
            ParamIndex::VideoHevc(port) => {
                st.codec_port(port, &[CodingType::Hevc])?;
                Ok(Param::VideoHevc(st.codec.hevc))
            }
            ParamIndex::AvcExtension(port) => {
                st.codec_port(port, &[CodingType::Avc])?;
                Ok(Param::AvcExtension(st.codec.extension))
            }
            ParamIndex::Deblocking(port) => {
                st.codec_port(port, VIDEO)?;
                Ok(Param::Deblocking {
                    port,
                    enabled: st.codec.deblocking,
                })
            }
            ParamIndex::Quantization(port) => {
                st.codec_port(port, VIDEO)?;
                Ok(Param::Quantization {
                    port,
                    qp_i: st.codec.qp_i,
                })
            }
            ParamIndex::QFactor(port) => {
                st.codec_port(port, &[CodingType::Jpeg])?;
                Ok(Param::QFactor {
                    port,
                    quality: st.codec.quality,
                })
            }
        }
    }

    fn set_parameter(&self, param: Param) -> OmxResult<()> {
        self.ensure_live()?;
        let mut st = self.lock()?;
        match param {
            Param::StandardComponentRole(role) => {
                if st.state != LifecycleState::Loaded {
                    return Err(OmxError::IncorrectStateOperation("role set outside Loaded".into()));
                }
                let coding = [CodingType::Avc, CodingType::Hevc, CodingType::Jpeg]
                    .into_iter()
                    .find(|c| c.role() == Some(role.as_str()))
                    .ok_or_else(|| OmxError::UnsupportedSetting(format!("role '{}'", role)))?;
                st.role = coding;
                let domain = if coding.is_image() { PortDomain::Image } else { PortDomain::Video };
                for port in &mut st.ports {
                    port.domain = domain;
                }
                st.ports[OUTPUT_PORT as usize].format.coding = coding;
                Ok(())
            }
            Param::PortDefinition(def) => {
                let index = def.index;
                let current = st.port(index)?.clone();
                if st.state != LifecycleState::Loaded && current.enabled {
                    return Err(OmxError::IncorrectStateOperation(format!(
                        "port {} definition set in state {}",
                        index, st.state
                    )));
                }
                if def.buffer_count_actual < current.buffer_count_min {
                    return Err(OmxError::BadParameter(format!(
                        "port {} needs at least {} buffers",
                        index, current.buffer_count_min
                    )));
                }
                if current.direction == Direction::Input && def.format.color == ColorFormat::Unused {
                    return Err(OmxError::UnsupportedSetting(format!(
                        "port {} color format unused",
                        index
                    )));
                }
                let port = &mut st.ports[index as usize];
                port.buffer_count_actual = def.buffer_count_actual;
                port.format = PortFormat {
                    stride: def.format.stride.max(def.format.width),
                    ..def.format
                };
                if port.direction == Direction::Output {
                    port.format.coding = current.format.coding;
                }
                port.buffer_size = def.buffer_size.max(required_buffer_size(port));
                Ok(())
            }
            Param::VideoBitrate { port, target_bps } => {
                st.port(port)?;
                if port != OUTPUT_PORT {
                    return Err(OmxError::BadParameter(format!("bitrate on port {}", port)));
                }
                st.ports[port as usize].format.bitrate = target_bps;
                Ok(())
            }
            Param::VideoAvc(avc) => {
                st.codec_settable(avc.port, &[CodingType::Avc])?;
                avc.check(CodingType::Avc).map_err(OmxError::BadParameter)?;
                st.codec.avc = avc;
                Ok(())
            }
            Param::VideoHevc(hevc) => {
                st.codec_settable(hevc.port, &[CodingType::Hevc])?;
                hevc.check(CodingType::Hevc).map_err(OmxError::BadParameter)?;
                st.codec.hevc = hevc;
                Ok(())
            }
            Param::AvcExtension(extension) => {
                st.codec_settable(extension.port, &[CodingType::Avc])?;
                extension.check().map_err(OmxError::BadParameter)?;
                st.codec.extension = extension;
                Ok(())
            }
            Param::Deblocking { port, enabled } => {
                st.codec_settable(port, VIDEO)?;
                st.codec.deblocking = enabled;
                Ok(())
            }
            Param::Quantization { port, qp_i } => {
                st.codec_settable(port, VIDEO)?;
                if qp_i > MAX_QP {
                    return Err(OmxError::BadParameter(format!("I frame QP {}", qp_i)));
                }
                st.codec.qp_i = qp_i;
                Ok(())
            }
            Param::QFactor { port, quality } => {
                st.codec_settable(port, &[CodingType::Jpeg])?;
                if !(1..=100).contains(&quality) {
                    return Err(OmxError::BadParameter(format!("JPEG quality {}", quality)));
                }
                st.codec.quality = quality;
                Ok(())
            }
            Param::VideoInit(_) | Param::ImageInit(_) => Err(OmxError::UnsupportedSetting(
                "port ranges are read-only".to_string(),
            )),
        }
    }

    fn allocate_buffer(&self, port: u32, size: usize) -> OmxResult<BufferHeader> {
        self.ensure_live()?;
        let buffer = {
            let mut st = self.lock()?;
            let allocating = st.state == LifecycleState::Loaded
                && st.pending == Some(LifecycleState::Idle);
            if !allocating {
                return Err(OmxError::IncorrectStateOperation(format!(
                    "allocation in state {}",
                    st.state
                )));
            }
            let def = st.port(port)?;
            if !def.enabled {
                return Err(OmxError::IncorrectStateOperation(format!("port {} disabled", port)));
            }
            if size < def.buffer_size {
                return Err(OmxError::BadParameter(format!(
                    "port {} buffers must hold {} bytes, asked for {}",
                    port, def.buffer_size, size
                )));
            }
            let memory = GuardedMemory::allocate(size)?;
            let id = st.next_id;
            st.next_id += 1;
            st.allocated[port as usize] += 1;
            BufferHeader::new(id, port, memory)
        };
        self.post_or_fail(Job::CheckTransition)?;
        Ok(buffer)
    }

    fn free_buffer(&self, buffer: BufferHeader) -> OmxResult<()> {
        let port = buffer.port();
        let id = buffer.id();
        {
            let mut st = self.lock()?;
            st.port(port)?;
            let count = &mut st.allocated[port as usize];
            *count = count.saturating_sub(1);
        }
        let result = buffer.into_memory().release(id);
        if !self.is_released() {
            let _ = self.post(Job::CheckTransition);
        }
        result
    }

    fn empty_this_buffer(&self, buffer: BufferHeader) -> SubmitResult {
        self.submit(buffer, false)
    }

    fn fill_this_buffer(&self, buffer: BufferHeader) -> SubmitResult {
        self.submit(buffer, true)
    }

    fn free_handle(&self) -> OmxResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Err(OmxError::BadParameter("component handle already released".to_string()));
        }
        self.jobs.lock().map_err(poisoned)?.take();
        self.callbacks.lock().map_err(poisoned)?.take();
        let worker = self.worker.lock().map_err(poisoned)?.take();
        if let Some(worker) = worker {
            // Released from one of our own callbacks: the worker exits on its own.
            if thread::current().name() != Some(worker.name()) {
                worker.join()?;
            }
        }
        tracing::debug!(component = %self.config.name, "handle released");
        Ok(())
    }
}
