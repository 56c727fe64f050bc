// Global configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `timing.start_delay_us`.
pub const START_DELAY_ENV: &str = "VSTART_DELAY";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub defaults: DefaultsConfig,
}

/// Waits, backoffs and pacing offsets used by every session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Bound on every lifecycle state-change wait
    #[serde(default = "default_event_timeout_ms")]
    pub event_timeout_ms: u32,

    /// Offset added to the pacing origin captured at frame 0
    #[serde(default = "default_start_delay_us")]
    pub start_delay_us: u64,

    /// Sleep when the feed loop finds no free input buffer
    #[serde(default = "default_input_backoff_ms")]
    pub input_backoff_ms: u64,

    /// Sleep when the sliced feed loop finds no free input buffer
    #[serde(default = "default_slice_backoff_ms")]
    pub slice_backoff_ms: u64,

    /// Poll interval while waiting for the end-of-stream output
    #[serde(default = "default_eos_poll_ms")]
    pub eos_poll_ms: u64,

    /// Give up waiting for the end-of-stream output after this long
    #[serde(default = "default_eos_drain_timeout_ms")]
    pub eos_drain_timeout_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Buffers allocated per port when the command line does not say
    #[serde(default = "default_buffer_count")]
    pub buffer_count: u32,

    /// tracing level filter (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Component instantiated for each session
    #[serde(default = "default_component")]
    pub component: String,
}

fn default_event_timeout_ms() -> u32 {
    10_000
}

fn default_start_delay_us() -> u64 {
    100_000
}

fn default_input_backoff_ms() -> u64 {
    1
}

fn default_slice_backoff_ms() -> u64 {
    10
}

fn default_eos_poll_ms() -> u64 {
    1
}

fn default_eos_drain_timeout_ms() -> u32 {
    30_000
}

fn default_buffer_count() -> u32 {
    9
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_component() -> String {
    "OMX.sim.video.encoder".to_string()
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            event_timeout_ms: default_event_timeout_ms(),
            start_delay_us: default_start_delay_us(),
            input_backoff_ms: default_input_backoff_ms(),
            slice_backoff_ms: default_slice_backoff_ms(),
            eos_poll_ms: default_eos_poll_ms(),
            eos_drain_timeout_ms: default_eos_drain_timeout_ms(),
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            buffer_count: default_buffer_count(),
            log_level: default_log_level(),
            component: default_component(),
        }
    }
}

impl TimingConfig {
    /// Pacing start delay, with `VSTART_DELAY` (microseconds) taking precedence.
    pub fn start_delay(&self) -> Duration {
        let from_env = std::env::var(START_DELAY_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok());
        Duration::from_micros(from_env.unwrap_or(self.start_delay_us))
    }
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = if cfg!(target_os = "macos") {
            dirs::home_dir()
                .context("Could not determine home directory")?
                .join(".config")
                .join("omxenc")
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("omxenc")
        };

        Ok(config_dir.join("config.toml"))
    }

    /// Load config from disk, or create default if it doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();

            // A read-only config dir is not fatal; fall back to built-ins.
            if let Err(e) = config.save() {
                tracing::warn!(
                    "could not create default config file ({:#}); run 'omxenc init-config' to create one",
                    e
                );
            }

            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}
