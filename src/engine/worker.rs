// Session pool: every encode session runs on its own thread

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

use super::core::OmxResult;
use super::osal::{OsalThread, ThreadPriority};
use super::session::Session;
use crate::stats::SessionReport;

/// Message from a session thread to the main thread
#[derive(Debug, Clone)]
pub enum SessionMessage {
    /// Session thread is up and about to configure its component
    SessionStarted { session: usize },

    /// Session ran to end of stream and tore down cleanly
    SessionCompleted(SessionReport),

    /// Session aborted; the report carries the partial counters
    SessionFailed {
        session: usize,
        code: String,
        error: String,
        report: SessionReport,
    },
}

/// Pool of concurrently running sessions
pub struct SessionPool {
    tx: Sender<SessionMessage>,
    rx: Receiver<SessionMessage>,
    active: Arc<AtomicUsize>,
    priority: ThreadPriority,
    threads: Vec<OsalThread<SessionReport>>,
}

impl SessionPool {
    pub fn new(priority: ThreadPriority) -> Self {
        let (tx, rx) = mpsc::channel();

        Self {
            tx,
            rx,
            active: Arc::new(AtomicUsize::new(0)),
            priority,
            threads: Vec::new(),
        }
    }

    /// Get the receiver for session messages
    pub fn receiver(&self) -> &Receiver<SessionMessage> {
        &self.rx
    }

    /// Start `session` on a new thread
    pub fn spawn(&mut self, session: Session) -> OmxResult<()> {
        let tx = self.tx.clone();
        let active = self.active.clone();
        let id = session.id();

        // Counted before the thread exists so active_count never misses a session.
        active.fetch_add(1, Ordering::SeqCst);
        let spawned = OsalThread::spawn(&format!("session-{}", id), self.priority, move || {
            let _ = tx.send(SessionMessage::SessionStarted { session: id });

            let report = session.run();

            let message = if report.is_failed() {
                SessionMessage::SessionFailed {
                    session: id,
                    code: report.error_code.clone().unwrap_or_default(),
                    error: report.error.clone().unwrap_or_default(),
                    report: report.clone(),
                }
            } else {
                SessionMessage::SessionCompleted(report.clone())
            };
            active.fetch_sub(1, Ordering::SeqCst);
            let _ = tx.send(message);
            report
        });

        match spawned {
            Ok(thread) => {
                self.threads.push(thread);
                Ok(())
            }
            Err(e) => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Number of sessions still running
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of sessions spawned
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Every session thread has exited, normally or not
    pub fn is_finished(&self) -> bool {
        self.threads.iter().all(OsalThread::is_finished)
    }

    /// Wait for every session thread, in spawn order
    pub fn join_all(self) -> Vec<OmxResult<SessionReport>> {
        self.threads.into_iter().map(OsalThread::join).collect()
    }
}
