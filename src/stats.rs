// Per-session reports

use serde::Serialize;
use std::fmt;
use std::path::Path;
use uuid::Uuid;

use crate::engine::core::OmxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    /// Unique id of this run of the session
    pub run_id: Uuid,

    pub session: usize,

    /// Component name as reported by the component
    pub component: String,

    pub input: String,
    pub output: String,

    pub status: SessionStatus,

    /// Input frames handed to the component
    pub frames_submitted: u64,

    /// Encoded frames written to the output
    pub frames_encoded: u64,

    pub codec_config_buffers: u64,
    pub bytes_written: u64,

    /// Frames submitted after their pacing deadline
    pub skipped_frames: u64,

    pub elapsed_ms: u64,

    /// Error classification when the session failed
    pub error_code: Option<String>,
    pub error: Option<String>,

    /// Session start (RFC 3339)
    pub started_at: String,
}

impl SessionReport {
    pub fn new(session: usize, component: &str, input: &Path, output: &Path) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            session,
            component: component.to_string(),
            input: input.display().to_string(),
            output: output.display().to_string(),
            status: SessionStatus::Running,
            frames_submitted: 0,
            frames_encoded: 0,
            codec_config_buffers: 0,
            bytes_written: 0,
            skipped_frames: 0,
            elapsed_ms: 0,
            error_code: None,
            error: None,
            started_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn complete(&mut self) {
        self.status = SessionStatus::Completed;
    }

    pub fn fail(&mut self, error: &OmxError) {
        self.status = SessionStatus::Failed;
        self.error_code = Some(error.code().to_string());
        self.error = Some(error.to_string());
    }

    pub fn is_failed(&self) -> bool {
        self.status == SessionStatus::Failed
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session {}: {} -> {}: {} frames in, {} frames out, {} written in {}",
            self.session,
            self.input,
            self.output,
            self.frames_submitted,
            self.frames_encoded,
            format_bytes(self.bytes_written),
            format_duration(self.elapsed_ms as f64 / 1000.0)
        )?;
        if self.skipped_frames > 0 {
            write!(f, " ({} late)", self.skipped_frames)?;
        }
        match (&self.status, &self.error_code, &self.error) {
            (SessionStatus::Failed, Some(code), Some(error)) => {
                write!(f, " FAILED [{}] {}", code, error)
            }
            (SessionStatus::Failed, _, _) => write!(f, " FAILED"),
            _ => Ok(()),
        }
    }
}

/// Format bytes as human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format duration in seconds, with millisecond precision under a minute
pub fn format_duration(seconds: f64) -> String {
    let total_secs = seconds as u64;
    let minutes = total_secs / 60;
    let secs = total_secs % 60;

    if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{:.3}s", seconds)
    }
}
