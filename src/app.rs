use crate::cli::{Cli, Commands, OsdFormat, OutputFormat};
use anyhow::{Context, Result, bail};
use omxenc::engine::osal::{OsalThread, ThreadPriority};
use omxenc::engine::sim::{self, SimConfig};
use omxenc::engine::source::{self, ProducerGeometry, REMOTE_PREFIX};
use omxenc::engine::{
    CodecSettings, CodingType, ColorFormat, FrameRate, OverlayConfig, Session, SessionConfig,
    SessionMessage, SessionPool,
};
use omxenc::stats::SessionReport;
use omxenc::{config, engine};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

pub fn run(cli: Cli) {
    // Handle subcommands first
    if let Some(command) = cli.command {
        match command {
            Commands::InitConfig => handle_init_config(),
        }
        return;
    }

    let config = config::Config::load().unwrap_or_default();

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.defaults.log_level.clone());
    if let Err(e) = engine::init_logging(&level, cli.log_file.as_deref()) {
        eprintln!("Error: {:#}", e);
        process::exit(2);
    }

    match run_sessions(&cli, &config) {
        Ok(reports) => {
            if cli.json {
                match serde_json::to_string_pretty(&reports) {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        eprintln!("Error: {:#}", e);
                        process::exit(1);
                    }
                }
            } else {
                for report in &reports {
                    println!("{}", report);
                }
            }
            if reports.iter().any(SessionReport::is_failed) {
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn coding(format: OutputFormat) -> CodingType {
    match format {
        OutputFormat::Avc => CodingType::Avc,
        OutputFormat::Hevc => CodingType::Hevc,
        OutputFormat::Jpeg => CodingType::Jpeg,
    }
}

fn codec_settings(cli: &Cli) -> CodecSettings {
    CodecSettings {
        profile: cli.profile,
        level: cli.level,
        p_frames: cli.p_frames,
        ref_frames: cli.ref_frames,
        cabac: cli.cabac.then_some(true),
        deblocking: !cli.no_deblocking,
        quantization: cli.qp,
        cpb_size: cli.cpb_size,
        preset: cli.preset,
        intra_qp_delta: cli.intra_qp_delta,
        qp_min_i: cli.qp_min_i,
        qp_max_i: cli.qp_max_i,
        qp_min_pb: cli.qp_min_pb,
        qp_max_pb: cli.qp_max_pb,
    }
}

/// Session 1 shares the GOP settings of session 0 when both use the same
/// coding; the AVC extension is never shared.
fn second_codec_settings(cli: &Cli, first: &CodecSettings, same_coding: bool) -> CodecSettings {
    let shared = if same_coding {
        CodecSettings {
            profile: first.profile,
            level: first.level,
            p_frames: first.p_frames,
            ref_frames: first.ref_frames,
            cabac: first.cabac,
            deblocking: first.deblocking,
            ..CodecSettings::default()
        }
    } else {
        CodecSettings::default()
    };
    CodecSettings {
        profile: cli.profile2.or(shared.profile),
        quantization: cli.qp2,
        ..shared
    }
}

/// Session settings from the command line, config filling the gaps.
fn session_configs(cli: &Cli, config: &config::Config) -> Result<Vec<SessionConfig>> {
    let Some(input) = cli.input.clone() else {
        bail!("no input given (use -i/--input)");
    };

    let mut base = SessionConfig::new(0, input, cli.output.clone());
    base.coding = coding(cli.output_format);
    base.width = cli.width;
    base.height = cli.height;
    base.stride = cli.stride;
    base.slice_height = cli.slice_height;
    base.color = if cli.input_format == 1 {
        ColorFormat::Yuv420SemiPlanar
    } else {
        ColorFormat::Yuv420Planar
    };
    base.first_frame = cli.first_frame;
    base.last_frame = cli.last_frame;
    base.input_rate = FrameRate::new(cli.input_rate, 1);
    base.output_rate = FrameRate::new(cli.output_rate, 1);
    base.pace_rate = cli
        .rate_numer
        .zip(cli.rate_denom)
        .map(|(numer, denom)| FrameRate::new(numer, denom));
    base.buffer_count = cli.buffer_count.unwrap_or(config.defaults.buffer_count);
    base.buffer_size = cli.buffer_size;
    base.bitrate = cli.bitrate;
    base.codec = codec_settings(cli);
    base.cache_mode = cli.cache_mode;
    base.timing = config.timing.clone();
    base.overlay = cli.osd.clone().map(|path| OverlayConfig {
        path,
        width: cli.osd_width,
        height: cli.osd_height,
        color: match cli.osd_format {
            OsdFormat::Argb => ColorFormat::Argb8888,
            OsdFormat::Yuv420 => ColorFormat::Yuv420Planar,
        },
    });

    let mut configs = vec![base.clone()];

    if let Some(input2) = cli.input2.clone() {
        let mut second = base.clone();
        second.id = 1;
        second.input = input2;
        second.output = cli.output2.clone();
        second.coding = cli.output_format2.map(coding).unwrap_or(second.coding);
        second.first_frame = cli.first_frame2.unwrap_or(second.first_frame);
        second.last_frame = cli.last_frame2.unwrap_or(second.last_frame);
        second.bitrate = cli.bitrate2.or(second.bitrate);
        second.codec = second_codec_settings(cli, &second.codec, second.coding == base.coding);
        configs.push(second);
    }

    if configs.iter().any(|c| c.output == configs[0].output && c.id != 0) {
        bail!("both sessions write to {}", configs[0].output.display());
    }
    Ok(configs)
}

fn run_sessions(cli: &Cli, config: &config::Config) -> Result<Vec<SessionReport>> {
    let configs = session_configs(cli, config)?;
    let component = cli
        .component
        .clone()
        .unwrap_or_else(|| config.defaults.component.clone());

    let mut pool = SessionPool::new(ThreadPriority(cli.priority));
    let mut producers = Vec::new();

    for cfg in configs {
        let handle = sim::get_handle(
            &component,
            SimConfig {
                latency: Duration::from_micros(cli.sim_latency_us),
                jitter_us: cli.sim_jitter_us,
                ..SimConfig::default()
            },
        )
        .with_context(|| format!("Failed to create component {}", component))?;

        let mut session = Session::new(cfg.clone(), handle);

        if source::is_remote(&cfg.input) {
            let path = PathBuf::from(
                cfg.input
                    .to_string_lossy()
                    .trim_start_matches(REMOTE_PREFIX)
                    .to_string(),
            );
            let geometry = ProducerGeometry {
                width: cfg.width,
                height: cfg.height,
                stride: cfg.stride(),
            };
            let max_frames = cfg.last_frame.saturating_sub(cfg.first_frame) + 1;
            let in_flight = cfg.buffer_count as usize;
            let (client, server) = source::loopback_pair();
            let producer = OsalThread::spawn(
                &format!("producer-{}", cfg.id),
                ThreadPriority::default(),
                move || server.serve_file(&path, geometry, Some(max_frames), in_flight),
            )
            .context("Failed to start remote frame producer")?;
            producers.push(producer);
            session = session.with_remote(Arc::new(client));
        }

        pool.spawn(session)
            .with_context(|| format!("Failed to start session {}", cfg.id))?;
    }

    watch(&pool);

    let mut reports = Vec::new();
    for result in pool.join_all() {
        match result {
            Ok(report) => reports.push(report),
            Err(e) => tracing::error!(error = %e, "session thread died"),
        }
    }
    for producer in producers {
        let name = producer.name().to_string();
        match producer.join() {
            Ok(Ok(frames)) => tracing::debug!(producer = %name, frames, "producer done"),
            Ok(Err(e)) | Err(e) => tracing::warn!(producer = %name, error = %e, "producer failed"),
        }
    }
    Ok(reports)
}

/// Log session messages until every session thread has exited.
fn watch(pool: &SessionPool) {
    loop {
        match pool.receiver().recv_timeout(Duration::from_millis(200)) {
            Ok(message) => log_message(&message),
            Err(RecvTimeoutError::Timeout) if pool.is_finished() => break,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    for message in pool.receiver().try_iter() {
        log_message(&message);
    }
}

fn log_message(message: &SessionMessage) {
    match message {
        SessionMessage::SessionStarted { session } => {
            tracing::info!(session, "session started");
        }
        SessionMessage::SessionCompleted(report) => {
            tracing::info!(
                session = report.session,
                frames = report.frames_encoded,
                bytes = report.bytes_written,
                "session completed"
            );
        }
        SessionMessage::SessionFailed {
            session,
            code,
            error,
            ..
        } => {
            tracing::warn!(session, code = %code, error = %error, "session failed");
        }
    }
}

fn handle_init_config() {
    match config::Config::config_path() {
        Ok(path) if path.exists() => match config::Config::load_from(&path) {
            Ok(cfg) => {
                println!("Config loaded successfully from {}", path.display());
                println!("{:#?}", cfg);
            }
            Err(e) => {
                eprintln!("Config invalid: {:#}", e);
                process::exit(1);
            }
        },
        Ok(path) => {
            println!("Config missing, creating default config...");
            if let Err(err) = config::Config::default().save_to(&path) {
                eprintln!("Failed to save default config: {:#}", err);
                process::exit(1);
            }
            println!("Default config saved to {}", path.display());
        }
        Err(e) => {
            eprintln!("Config path unknown: {:#}", e);
            process::exit(1);
        }
    }
}
