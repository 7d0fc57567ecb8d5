//! Structured log entries forwarded from worker to host.

use serde::{Deserialize, Serialize};

/// Severity/category of a [`LogEntry`].
///
/// `Stdout`/`Stderr` are synthetic levels assigned to lines captured from the
/// worker's redirected standard streams rather than emitted through the
/// logging framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    Stdout,
    Stderr,
}

impl LogLevel {
    /// Map from `tracing::Level` as observed by the worker's subscriber layer.
    pub fn from_tracing(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE | tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warning,
            tracing::Level::ERROR => LogLevel::Critical,
        }
    }

    /// Parse a job-request/CLI supplied level name (`"DEBUG"`, `"INFO"`, ...).
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARNING" | "WARN" => Some(LogLevel::Warning),
            "ERROR" => Some(LogLevel::Error),
            "CRITICAL" => Some(LogLevel::Critical),
            _ => None,
        }
    }

    /// Ordering rank used to compare against a configured minimum level.
    /// `Stdout`/`Stderr` entries are never filtered by level.
    fn rank(self) -> u8 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warning => 2,
            LogLevel::Error => 3,
            LogLevel::Critical => 4,
            LogLevel::Stdout | LogLevel::Stderr => u8::MAX,
        }
    }

    pub fn at_least(self, min: LogLevel) -> bool {
        self.rank() >= min.rank()
    }
}

/// A single structured log line, as forwarded over the IPC channel.
///
/// `timestamp` is RFC-3339, UTC, millisecond precision (e.g.
/// `2026-07-28T12:00:00.123Z`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    pub level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(rename = "lineNumber", skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
}

impl LogEntry {
    pub fn new(message: impl Into<String>, level: LogLevel) -> Self {
        Self {
            message: message.into(),
            level,
            file: None,
            line_number: None,
            timestamp: now_rfc3339_millis(),
            logger: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line_number = Some(line);
        self
    }

    pub fn with_logger(mut self, logger: impl Into<String>) -> Self {
        self.logger = Some(logger.into());
        self
    }
}

/// RFC-3339, UTC, millisecond-precision timestamp for the current instant.
pub fn now_rfc3339_millis() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}
