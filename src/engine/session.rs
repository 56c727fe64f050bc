//! One encode session: configure the component, stream a source through
//! it and tear everything down again.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use super::component::{Command, Component, Param, ParamIndex};
use super::core::{
    AVC_PROFILE_HIGH, CodingType, ColorFormat, FrameRate, INPUT_PORT, LifecycleState, OUTPUT_PORT,
    OVERLAY_PORT, OmxError, OmxResult, PortDefinition, PortRange, VideoCoding,
};
use super::exchange::{ExchangeEngine, QueueCapacities};
use super::feed::{self, FeedContext, FeedStats, RangeFeed, RemoteGeometry, SlicedFeed};
use super::lifecycle::LifecycleController;
use super::osal::Event;
use super::pacer::Pacer;
use super::source::{ClientMessage, FileSource, FrameChannel, LoopingSource};
use crate::config::TimingConfig;
use crate::stats::SessionReport;

/// Secondary picture blended by the component (on-screen display).
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayConfig {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub color: ColorFormat,
}

impl OverlayConfig {
    pub fn frame_size(&self) -> OmxResult<usize> {
        self.color
            .frame_size(self.width, self.height)
            .filter(|n| *n > 0)
            .ok_or_else(|| OmxError::BadParameter("overlay has no frame size".to_string()))
    }
}

/// AVC level used unless one is asked for.
pub const DEFAULT_AVC_LEVEL: u32 = 51;

/// Encoder settings of the output port. `None` keeps what the component
/// reports, except that AVC defaults to High profile at level 5.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecSettings {
    pub profile: Option<u32>,
    pub level: Option<u32>,
    pub p_frames: Option<u32>,
    pub ref_frames: Option<u32>,
    pub cabac: Option<bool>,
    pub deblocking: bool,
    /// I frame QP for video, quality factor for JPEG.
    pub quantization: Option<u32>,
    pub cpb_size: Option<u32>,
    pub preset: Option<u32>,
    pub intra_qp_delta: Option<i32>,
    pub qp_min_i: Option<u32>,
    pub qp_max_i: Option<u32>,
    pub qp_min_pb: Option<u32>,
    pub qp_max_pb: Option<u32>,
}

impl Default for CodecSettings {
    fn default() -> Self {
        Self {
            profile: None,
            level: None,
            p_frames: None,
            ref_frames: None,
            cabac: None,
            deblocking: true,
            quantization: None,
            cpb_size: None,
            preset: None,
            intra_qp_delta: None,
            qp_min_i: None,
            qp_max_i: None,
            qp_min_pb: None,
            qp_max_pb: None,
        }
    }
}

impl CodecSettings {
    fn apply_video(&self, coding: &mut VideoCoding) {
        if let Some(profile) = self.profile {
            coding.profile = profile;
        }
        if let Some(level) = self.level {
            coding.level = level;
        }
        if let Some(n) = self.p_frames {
            coding.p_frames = n;
        }
        if let Some(n) = self.ref_frames {
            coding.ref_frames = n;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub id: usize,
    pub input: PathBuf,
    pub output: PathBuf,
    pub coding: CodingType,
    pub width: u32,
    pub height: u32,
    /// Row pitch of input buffers; `None` means the picture width.
    pub stride: Option<u32>,
    /// Submit the input in slices of this many rows.
    pub slice_height: Option<u32>,
    pub color: ColorFormat,
    pub first_frame: u64,
    pub last_frame: u64,
    pub input_rate: FrameRate,
    pub output_rate: FrameRate,
    /// Wall-clock submission rate; unpaced when `None`.
    pub pace_rate: Option<FrameRate>,
    pub buffer_count: u32,
    /// Minimum buffer size; the component may ask for more.
    pub buffer_size: Option<usize>,
    pub bitrate: Option<u32>,
    pub codec: CodecSettings,
    pub overlay: Option<OverlayConfig>,
    /// Stop re-reading the source once every input buffer holds a frame.
    pub cache_mode: bool,
    pub timing: TimingConfig,
}

impl SessionConfig {
    pub fn new(id: usize, input: PathBuf, output: PathBuf) -> Self {
        Self {
            id,
            input,
            output,
            coding: CodingType::Avc,
            width: 176,
            height: 144,
            stride: None,
            slice_height: None,
            color: ColorFormat::Yuv420Planar,
            first_frame: 0,
            last_frame: 100,
            input_rate: FrameRate::new(30, 1),
            output_rate: FrameRate::new(30, 1),
            pace_rate: None,
            buffer_count: 9,
            buffer_size: None,
            bitrate: None,
            codec: CodecSettings::default(),
            overlay: None,
            cache_mode: false,
            timing: TimingConfig::default(),
        }
    }

    pub fn stride(&self) -> u32 {
        self.stride.unwrap_or(self.width).max(self.width)
    }

    fn is_sliced(&self) -> bool {
        self.slice_height.is_some_and(|h| h > 0 && h < self.height)
    }

    /// Reject settings no component could accept.
    pub fn validate(&self) -> OmxResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(OmxError::BadParameter(format!(
                "picture size {}x{}",
                self.width, self.height
            )));
        }
        if self.first_frame > self.last_frame {
            return Err(OmxError::BadParameter(format!(
                "first frame {} is after last frame {}",
                self.first_frame, self.last_frame
            )));
        }
        if self.buffer_count == 0 {
            return Err(OmxError::BadParameter("buffer count must be positive".to_string()));
        }
        if self.coding.role().is_none() {
            return Err(OmxError::UnsupportedSetting(format!(
                "output coding {:?}",
                self.coding
            )));
        }
        if self.overlay.is_some() && self.is_sliced() {
            return Err(OmxError::UnsupportedSetting(
                "overlay with sliced input".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct Session {
    config: SessionConfig,
    component: Arc<dyn Component>,
    remote: Option<Arc<dyn FrameChannel>>,
}

impl Session {
    pub fn new(config: SessionConfig, component: Arc<dyn Component>) -> Self {
        Self {
            config,
            component,
            remote: None,
        }
    }

    /// Take input frames from a remote producer instead of the input file.
    pub fn with_remote(mut self, channel: Arc<dyn FrameChannel>) -> Self {
        self.remote = Some(channel);
        self
    }

    pub fn id(&self) -> usize {
        self.config.id
    }

    /// Run to completion. Never panics on component failure: the outcome is
    /// in the report.
    pub fn run(self) -> SessionReport {
        let mut report = SessionReport::new(
            self.config.id,
            self.component.name(),
            &self.config.input,
            &self.config.output,
        );
        let started = Instant::now();
        tracing::info!(
            session = self.config.id,
            input = %self.config.input.display(),
            output = %self.config.output.display(),
            "session starting"
        );

        let result = self.execute(&mut report);
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                report.complete();
                tracing::info!(session = self.config.id, elapsed_ms = report.elapsed_ms, "session complete");
            }
            Err(e) => {
                tracing::error!(session = self.config.id, code = e.code(), error = %e, "session failed");
                report.fail(&e);
            }
        }
        report
    }

    fn execute(&self, report: &mut SessionReport) -> OmxResult<()> {
        let id = self.config.id;
        let state_changed = Arc::new(Event::new());
        let lifecycle = LifecycleController::new(
            id,
            Arc::clone(&self.component),
            Arc::clone(&state_changed),
            self.config.timing.event_timeout_ms,
        );

        let ports = match self.prepare(&lifecycle, report) {
            Ok(ports) => ports,
            Err(e) => {
                let _ = self.component.free_handle();
                return Err(e);
            }
        };

        let exchange = match self.open_exchange(&ports, state_changed) {
            Ok(exchange) => exchange,
            Err(e) => {
                let _ = self.component.free_handle();
                return Err(e);
            }
        };

        let result = self.stream(&lifecycle, &exchange, &ports, report);

        let teardown = match &result {
            Err(e) if e.is_fatal() => self.component.free_handle(),
            _ => lifecycle.teardown(&exchange),
        };

        if let Ok(stats) = exchange.stats() {
            report.frames_encoded = stats.frames_encoded;
            report.codec_config_buffers = stats.codec_config_buffers;
            report.bytes_written = stats.bytes_written;
        }
        if let Some(remote) = &self.remote {
            let _ = remote.send(ClientMessage::Exit);
        }

        result.and(teardown)
    }

    /// Version check, role and port settings, all while `Loaded`.
    fn prepare(
        &self,
        lifecycle: &LifecycleController,
        report: &mut SessionReport,
    ) -> OmxResult<Vec<PortDefinition>> {
        self.config.validate()?;
        let version = lifecycle.check_version()?;
        report.component = version.name;

        let role = self
            .config
            .coding
            .role()
            .ok_or_else(|| OmxError::UnsupportedSetting(format!("{:?}", self.config.coding)))?;
        self.component
            .set_parameter(Param::StandardComponentRole(role.to_string()))?;
        tracing::info!(session = self.config.id, role, "component role set");

        let ports = self.configure_ports()?;
        if self.config.overlay.is_some() && ports.len() <= OVERLAY_PORT as usize {
            return Err(OmxError::UnsupportedSetting(format!(
                "overlay needs {} ports, component has {}",
                OVERLAY_PORT + 1,
                ports.len()
            )));
        }

        if let Some(target_bps) = self.config.bitrate {
            self.component.set_parameter(Param::VideoBitrate {
                port: OUTPUT_PORT,
                target_bps,
            })?;
        }
        self.configure_codec()?;
        Ok(ports)
    }

    fn query<T>(
        &self,
        index: ParamIndex,
        pick: impl FnOnce(&Param) -> Option<T>,
    ) -> OmxResult<T> {
        let answer = self.component.get_parameter(index)?;
        pick(&answer).ok_or_else(|| {
            OmxError::BadParameter(format!("unexpected answer to {:?}: {:?}", index, answer))
        })
    }

    /// Get, adjust and set the encoder settings of the output coding.
    fn configure_codec(&self) -> OmxResult<()> {
        let id = self.config.id;
        let codec = &self.config.codec;
        match self.config.coding {
            CodingType::Avc => {
                let mut avc = self.query(ParamIndex::VideoAvc(OUTPUT_PORT), |p| match p {
                    Param::VideoAvc(avc) => Some(*avc),
                    _ => None,
                })?;
                avc.profile = AVC_PROFILE_HIGH;
                avc.level = DEFAULT_AVC_LEVEL;
                codec.apply_video(&mut avc);
                if let Some(cabac) = codec.cabac {
                    avc.cabac = cabac;
                }
                self.component.set_parameter(Param::VideoAvc(avc))?;
                tracing::info!(
                    session = id,
                    profile = %format!("{:#x}", avc.profile),
                    level = avc.level,
                    p_frames = avc.p_frames,
                    ref_frames = avc.ref_frames,
                    cabac = avc.cabac,
                    "AVC coding set"
                );

                let mut ext = self.query(ParamIndex::AvcExtension(OUTPUT_PORT), |p| match p {
                    Param::AvcExtension(ext) => Some(*ext),
                    _ => None,
                })?;
                let fields = [
                    (&mut ext.cpb_size, codec.cpb_size),
                    (&mut ext.preset, codec.preset),
                    (&mut ext.qp_min_i, codec.qp_min_i),
                    (&mut ext.qp_max_i, codec.qp_max_i),
                    (&mut ext.qp_min_pb, codec.qp_min_pb),
                    (&mut ext.qp_max_pb, codec.qp_max_pb),
                ];
                for (field, value) in fields {
                    if let Some(value) = value {
                        *field = value;
                    }
                }
                if let Some(delta) = codec.intra_qp_delta {
                    ext.intra_qp_delta = delta;
                }
                self.component.set_parameter(Param::AvcExtension(ext))?;
                self.configure_filtering()
            }
            CodingType::Hevc => {
                let mut hevc = self.query(ParamIndex::VideoHevc(OUTPUT_PORT), |p| match p {
                    Param::VideoHevc(hevc) => Some(*hevc),
                    _ => None,
                })?;
                codec.apply_video(&mut hevc);
                self.component.set_parameter(Param::VideoHevc(hevc))?;
                tracing::info!(
                    session = id,
                    profile = %format!("{:#x}", hevc.profile),
                    level = hevc.level,
                    p_frames = hevc.p_frames,
                    ref_frames = hevc.ref_frames,
                    "HEVC coding set"
                );
                self.configure_filtering()
            }
            CodingType::Jpeg => {
                let Some(quality) = codec.quantization else {
                    return Ok(());
                };
                let port = self.query(ParamIndex::QFactor(OUTPUT_PORT), |p| match p {
                    Param::QFactor { port, .. } => Some(*port),
                    _ => None,
                })?;
                self.component.set_parameter(Param::QFactor { port, quality })?;
                tracing::info!(session = id, quality, "JPEG quality set");
                Ok(())
            }
            CodingType::Unused => Err(OmxError::UnsupportedSetting("no output coding".to_string())),
        }
    }

    /// Deblocking and initial quantization, shared by the video codings.
    fn configure_filtering(&self) -> OmxResult<()> {
        let codec = &self.config.codec;
        let port = self.query(ParamIndex::Deblocking(OUTPUT_PORT), |p| match p {
            Param::Deblocking { port, .. } => Some(*port),
            _ => None,
        })?;
        self.component.set_parameter(Param::Deblocking {
            port,
            enabled: codec.deblocking,
        })?;

        let (port, mut qp_i) = self.query(ParamIndex::Quantization(OUTPUT_PORT), |p| match p {
            Param::Quantization { port, qp_i } => Some((*port, *qp_i)),
            _ => None,
        })?;
        if let Some(qp) = codec.quantization {
            qp_i = qp;
        }
        self.component.set_parameter(Param::Quantization { port, qp_i })?;
        tracing::debug!(
            session = self.config.id,
            deblocking = codec.deblocking,
            qp_i,
            "filtering set"
        );
        Ok(())
    }

    fn port_range(&self) -> OmxResult<PortRange> {
        let (index, image) = if self.config.coding.is_image() {
            (ParamIndex::ImageInit, true)
        } else {
            (ParamIndex::VideoInit, false)
        };
        match (self.component.get_parameter(index)?, image) {
            (Param::ImageInit(range), true) | (Param::VideoInit(range), false) => Ok(range),
            (other, _) => Err(OmxError::BadParameter(format!(
                "unexpected port range answer {:?}",
                other
            ))),
        }
    }

    fn port_definition(&self, index: u32) -> OmxResult<PortDefinition> {
        match self.component.get_parameter(ParamIndex::PortDefinition(index))? {
            Param::PortDefinition(def) => Ok(def),
            other => Err(OmxError::BadParameter(format!(
                "unexpected port definition answer {:?}",
                other
            ))),
        }
    }

    fn apply_port_settings(&self, def: &mut PortDefinition) {
        let cfg = &self.config;
        def.buffer_count_actual = cfg.buffer_count.max(def.buffer_count_min);
        def.buffer_size = cfg.buffer_size.unwrap_or(0);
        match def.index {
            INPUT_PORT => {
                def.format.width = cfg.width;
                def.format.height = cfg.height;
                def.format.stride = cfg.stride();
                def.format.slice_height = if cfg.is_sliced() {
                    cfg.slice_height.unwrap_or(cfg.height)
                } else {
                    cfg.height
                };
                def.format.color = cfg.color;
                def.format.framerate_q16 = cfg.input_rate.to_q16();
            }
            OUTPUT_PORT => {
                def.format.width = cfg.width;
                def.format.height = cfg.height;
                def.format.stride = cfg.width;
                def.format.slice_height = cfg.height;
                def.format.framerate_q16 = cfg.output_rate.to_q16();
                if let Some(bitrate) = cfg.bitrate {
                    def.format.bitrate = bitrate;
                }
            }
            OVERLAY_PORT => {
                if let Some(overlay) = &cfg.overlay {
                    def.format.width = overlay.width;
                    def.format.height = overlay.height;
                    def.format.stride = overlay.width;
                    def.format.slice_height = overlay.height;
                    def.format.color = overlay.color;
                }
            }
            _ => {}
        }
    }

    /// Get, adjust, set and read back every port the component reports.
    fn configure_ports(&self) -> OmxResult<Vec<PortDefinition>> {
        let range = self.port_range()?;
        let mut ports = Vec::with_capacity(range.count as usize);
        for index in range.start..range.start + range.count {
            let mut def = self.port_definition(index)?;
            self.apply_port_settings(&mut def);
            self.component.set_parameter(Param::PortDefinition(def))?;

            let def = self.port_definition(index)?;
            tracing::info!(
                session = self.config.id,
                port = index,
                direction = ?def.direction,
                domain = ?def.domain,
                width = def.format.width,
                height = def.format.height,
                stride = def.format.stride,
                slice_height = def.format.slice_height,
                color = ?def.format.color,
                coding = ?def.format.coding,
                buffers = def.buffer_count_actual,
                buffer_size = def.buffer_size,
                "port configured"
            );
            ports.push(def);
        }
        Ok(ports)
    }

    fn open_exchange(
        &self,
        ports: &[PortDefinition],
        state_changed: Arc<Event>,
    ) -> OmxResult<Arc<ExchangeEngine>> {
        let count = |index: u32| {
            ports
                .iter()
                .find(|p| p.index == index)
                .map_or(0, |p| p.buffer_count_actual as usize)
        };
        let sink = File::create(&self.config.output).map_err(|e| {
            OmxError::StreamCorrupt(format!(
                "cannot create {}: {}",
                self.config.output.display(),
                e
            ))
        })?;
        let exchange = Arc::new(ExchangeEngine::new(
            self.config.id,
            QueueCapacities {
                input: count(INPUT_PORT),
                output: count(OUTPUT_PORT),
                overlay: count(OVERLAY_PORT),
            },
            Box::new(sink),
            state_changed,
            self.remote.clone(),
        )?);
        self.component.set_callbacks(exchange.clone())?;
        Ok(exchange)
    }

    /// Loaded -> Idle -> Executing, feed until end of stream.
    fn stream(
        &self,
        lifecycle: &LifecycleController,
        exchange: &ExchangeEngine,
        ports: &[PortDefinition],
        report: &mut SessionReport,
    ) -> OmxResult<()> {
        let use_overlay = self.config.overlay.is_some();
        if !use_overlay && ports.len() > OVERLAY_PORT as usize {
            self.component
                .send_command(Command::PortDisable(OVERLAY_PORT))?;
        }

        lifecycle.request_state(LifecycleState::Idle)?;
        self.allocate_buffers(exchange, ports, use_overlay)?;
        lifecycle.wait_for_state(LifecycleState::Idle, lifecycle.timeout_ms())?;
        lifecycle.change_state_and_wait(LifecycleState::Executing)?;

        if let Some(remote) = &self.remote {
            remote.connect()?;
        }

        let ctx = FeedContext {
            session: self.config.id,
            component: self.component.as_ref(),
            exchange,
            timing: &self.config.timing,
        };
        feed::prime_outputs(&ctx)?;

        let input_port = ports
            .iter()
            .find(|p| p.index == INPUT_PORT)
            .ok_or_else(|| OmxError::BadParameter("component has no input port".to_string()))?;
        let stats = self.feed(&ctx, input_port)?;
        report.frames_submitted = stats.frames_submitted;
        report.skipped_frames = stats.skipped;

        feed::wait_for_eos(&ctx)
    }

    fn allocate_buffers(
        &self,
        exchange: &ExchangeEngine,
        ports: &[PortDefinition],
        use_overlay: bool,
    ) -> OmxResult<()> {
        for def in ports {
            if def.index == OVERLAY_PORT && !use_overlay {
                continue;
            }
            let size = self.allocation_size(def);
            for _ in 0..def.buffer_count_actual {
                let buffer = self.component.allocate_buffer(def.index, size)?;
                exchange.requeue(buffer)?;
            }
            tracing::debug!(
                session = self.config.id,
                port = def.index,
                count = def.buffer_count_actual,
                size,
                "buffers allocated"
            );
        }
        Ok(())
    }

    fn allocation_size(&self, def: &PortDefinition) -> usize {
        def.buffer_size.max(self.config.buffer_size.unwrap_or(0))
    }

    fn pacer(&self) -> OmxResult<Pacer> {
        Pacer::new(
            self.config.input_rate,
            self.config.output_rate,
            self.config.first_frame,
            self.config.pace_rate,
            self.config.timing.start_delay(),
        )
    }

    fn feed(&self, ctx: &FeedContext<'_>, input_port: &PortDefinition) -> OmxResult<FeedStats> {
        let cfg = &self.config;

        if let Some(remote) = &self.remote {
            let geometry = RemoteGeometry {
                width: input_port.format.width,
                height: input_port.format.height,
                stride: input_port.format.stride,
            };
            return feed::run_remote(ctx, remote.as_ref(), geometry);
        }

        let source = FileSource::open(&cfg.input)?;
        if cfg.is_sliced() {
            let mut sliced = SlicedFeed::new(
                source,
                cfg.color,
                cfg.width,
                cfg.height,
                input_port.format.stride,
                cfg.slice_height.unwrap_or(cfg.height),
                cfg.last_frame,
                self.pacer()?,
            )?;
            return feed::run_sliced(ctx, &mut sliced);
        }

        let frame_size = cfg
            .color
            .frame_size(cfg.width, cfg.height)
            .filter(|n| *n > 0)
            .ok_or_else(|| OmxError::BadParameter(format!("no frame size for {:?}", cfg.color)))?;
        let mut range = RangeFeed::new(source, frame_size, cfg.last_frame, self.pacer()?)
            .with_stride(cfg.color, cfg.width, cfg.height, input_port.format.stride)?;
        if let Some(overlay) = &cfg.overlay {
            range = range.with_overlay(LoopingSource::open(&overlay.path, overlay.frame_size()?)?);
        }
        if cfg.cache_mode {
            range = range.with_cache_after(u64::from(input_port.buffer_count_actual));
        }
        range.check_buffer_size(self.allocation_size(input_port))?;
        feed::run_range(ctx, &mut range)
    }
}
