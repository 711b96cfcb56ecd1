//! # Log Sink - Durable Session Event Log
//!
//! ## Why This Module Exists
//! Every significant session event (connect, disconnect, inbound message,
//! failure) is recorded as an append-only sequence of [`LogRecord`]s so the
//! presentation layer can show a session history and users can audit what
//! happened to a connection after the fact. The session manager only ever
//! appends; listing and clearing are explicit external actions.
//!
//! ## Design Philosophy
//! Appends must never block or fail the operation that triggered them. The
//! [`LogSink`] trait is therefore infallible at the call site: implementations
//! swallow storage errors into `tracing` diagnostics. The file-backed
//! implementation keeps records in memory and lets a background writer task
//! persist them, so a slow disk never stalls the connection path.

pub mod file;

pub use file::FileLogSink;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity attached to a [`LogRecord`].
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{label}")
    }
}

/// One entry in the session event log.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: String,
    pub text: String,
    #[serde(rename = "type")]
    pub severity: Severity,
}

impl LogRecord {
    /// Builds a record stamped with the current local time.
    pub fn now(text: &str, severity: Severity) -> Self {
        Self {
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            text: text.to_string(),
            severity,
        }
    }
}

/// Append-only event log consumed by the session manager.
///
/// Implementations must be safe for concurrent appends and must not
/// propagate storage failures to callers.
pub trait LogSink: Send + Sync {
    /// Records an event. Blank text is ignored.
    fn append(&self, text: &str, severity: Severity);

    /// Snapshot of all records in append order.
    fn list(&self) -> Vec<LogRecord>;

    /// Drops all records, including persisted ones.
    fn clear(&self);
}
