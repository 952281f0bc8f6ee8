//! Logger settings threaded into broker connections.
//!
//! A [`LogConfig`] is attached to the selector and copied into every newly
//! built connection. Changing it on the selector does not touch a connection
//! that is already live; the new settings apply from the next reconnect.

use std::fmt;

/// Minimum severity a connection reports.
///
/// Mirrors the nsqd client log levels. [`LogLevel::Off`] silences the
/// connection entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Frame-level chatter: dials, probes, heartbeats.
    Debug,
    /// Connection lifecycle events.
    #[default]
    Info,
    /// Recoverable failures.
    Warning,
    /// Failures that drop the connection.
    Error,
    /// Nothing is logged.
    Off,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Off => write!(f, "off"),
        }
    }
}

/// Logging settings for broker connections.
///
/// # Example
///
/// ```
/// use nsq_proxy::{LogConfig, LogLevel};
///
/// let log = LogConfig::new(LogLevel::Warning).with_label("billing");
/// assert!(log.enabled(LogLevel::Error));
/// assert!(!log.enabled(LogLevel::Info));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    level: LogLevel,
    label: Option<String>,
}

impl LogConfig {
    /// Creates settings that log at `level` and above.
    #[must_use]
    pub fn new(level: LogLevel) -> Self {
        Self { level, label: None }
    }

    /// Creates settings that log nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(LogLevel::Off)
    }

    /// Attaches a label that is emitted as a field on every event.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Returns the configured level.
    #[must_use]
    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Returns the configured label, or an empty string.
    #[must_use]
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or_default()
    }

    /// Returns whether an event at `level` should be emitted.
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        self.level != LogLevel::Off && level >= self.level
    }
}

/// Emits a `tracing` event if the connection's [`LogConfig`] allows it.
macro_rules! conn_log {
    ($log:expr, Debug, $($arg:tt)+) => {
        if $log.enabled($crate::logging::LogLevel::Debug) {
            tracing::debug!(label = $log.label(), $($arg)+);
        }
    };
    ($log:expr, Info, $($arg:tt)+) => {
        if $log.enabled($crate::logging::LogLevel::Info) {
            tracing::info!(label = $log.label(), $($arg)+);
        }
    };
    ($log:expr, Warning, $($arg:tt)+) => {
        if $log.enabled($crate::logging::LogLevel::Warning) {
            tracing::warn!(label = $log.label(), $($arg)+);
        }
    };
    ($log:expr, Error, $($arg:tt)+) => {
        if $log.enabled($crate::logging::LogLevel::Error) {
            tracing::error!(label = $log.label(), $($arg)+);
        }
    };
}

pub(crate) use conn_log;
