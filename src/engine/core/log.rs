use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing::Level;

/// Parse a log level name (`error`, `warn`, `info`, `debug`, `trace`).
pub fn parse_level(name: &str) -> Result<Level> {
    name.trim()
        .parse::<Level>()
        .map_err(|_| anyhow::anyhow!("unknown log level '{}'", name))
}

/// Install the global tracing subscriber.
///
/// Output goes to stderr unless `log_file` is given, in which case the file is
/// appended to (created if needed). Calling this twice is harmless: the second
/// install fails silently and the first subscriber stays active.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let level = parse_level(level)?;

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_names(true)
        .with_target(false);

    #[cfg(feature = "dev-logging")]
    let builder = builder.with_file(true).with_line_number(true);

    match log_file {
        Some(path) => {
            let file = open_log_file(path)?;
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
    Ok(())
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))
}
