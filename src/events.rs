//! Event sink for user-facing notices
//!
//! The core never prints. Notices go to `tracing` and, when a consumer
//! has subscribed, to a typed channel of [`LogEvent`]s that a front end
//! can render however it likes.

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Notice severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Severity::Info => "INFO",
            Severity::Success => "SUCCESS",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// A single notice
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub severity: Severity,
    pub message: String,
    pub at: DateTime<Local>,
}

impl LogEvent {
    /// `SEVERITY - date time - message`
    pub fn full_message(&self) -> String {
        format!(
            "{} - {} - {}",
            self.severity,
            self.at.format("%Y-%m-%d %H:%M:%S"),
            self.message
        )
    }
}

/// Cloneable handle used by the server and sessions to report notices
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<mpsc::UnboundedSender<LogEvent>>,
}

impl EventSink {
    /// A sink that only logs through `tracing`
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that also forwards every notice to the returned receiver
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sender: Some(tx) }, rx)
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(Severity::Info, message.into());
    }

    pub fn success(&self, message: impl Into<String>) {
        self.emit(Severity::Success, message.into());
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(Severity::Warning, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(Severity::Error, message.into());
    }

    fn emit(&self, severity: Severity, message: String) {
        match severity {
            Severity::Info => info!("{}", message),
            Severity::Success => info!(outcome = "success", "{}", message),
            Severity::Warning => warn!("{}", message),
            Severity::Error => error!("{}", message),
        }

        if let Some(sender) = &self.sender {
            // Consumer may have gone away; notices are best-effort
            let _ = sender.send(LogEvent {
                severity,
                message,
                at: Local::now(),
            });
        }
    }
}
