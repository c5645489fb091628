// User-facing status notifications
//
// The throttler reports what it did through a sink instead of touching the
// terminal directly. The interactive panel drains a channel; headless mode logs.

use chrono::{DateTime, Local};
use std::fmt;
use std::sync::mpsc::{Receiver, Sender, channel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Throttled,
    Unthrottled,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            Severity::Info => "info",
            Severity::Throttled => "throttled",
            Severity::Unthrottled => "unthrottled",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub at: DateTime<Local>,
    pub text: String,
    pub severity: Severity,
}

/// Receives status updates. Must not block: it is called from the
/// interception worker as well as the control surface.
pub trait StatusSink: Send + Sync {
    fn notify(&self, message: &str, severity: Severity);
}

/// Sends every status line to the log
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Error => log::error!("{}", message),
            Severity::Warning => log::warn!("{}", message),
            _ => log::info!("{}", message),
        }
    }
}

/// Forwards status lines over an unbounded channel
pub struct ChannelStatusSink {
    tx: Sender<StatusMessage>,
}

impl ChannelStatusSink {
    pub fn new() -> (Self, Receiver<StatusMessage>) {
        let (tx, rx) = channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelStatusSink {
    fn notify(&self, message: &str, severity: Severity) {
        log::debug!("status [{}]: {}", severity, message);
        // Receiver gone means the panel has shut down
        let _ = self.tx.send(StatusMessage {
            at: Local::now(),
            text: message.to_string(),
            severity,
        });
    }
}
