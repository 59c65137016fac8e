//! Structured log mapping on top of the ambient context.
//!
//! A [`LogEvent`] is what a logging front end knows about a log call. The
//! [`LogEventMapper`] turns it into a [`LogRecord`] with severity, attributes
//! and the ambient [`Context`] read at mapping time, and hands it to a
//! [`LogSink`]. [`ContextLogger`] plugs the same mapping into the `log`
//! facade, using the current context's diagnostic attributes as the mapped
//! diagnostic context.

pub mod bridge;
pub mod mapper;

pub use bridge::ContextLogger;
pub use mapper::{LogEventMapper, MapperConfig};

use std::error::Error;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use opentelemetry::logs::Severity;
use opentelemetry::{Key, KeyValue, Value};
use parking_lot::Mutex;

use crate::context::{Attributes, Context};

// ---------------------------------------------------------------------------
// LogEvent
// ---------------------------------------------------------------------------

/// Error details captured from a `std::error::Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub type_name: String,
    pub message: String,
    /// The error and its `source()` chain, one per line.
    pub stacktrace: String,
}

impl ErrorInfo {
    pub fn capture<E: Error + 'static>(err: &E) -> Self {
        let mut stacktrace = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            let _ = write!(stacktrace, "\ncaused by: {}", cause);
            source = cause.source();
        }
        Self {
            type_name: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
            stacktrace,
        }
    }
}

/// Source location of a log call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub file: Option<String>,
    pub namespace: String,
    pub function: Option<String>,
    pub line: u32,
}

/// A log call as seen by the logging front end.
#[derive(Debug, Clone)]
pub struct LogEvent {
    /// Logger (target) name; empty maps to `ROOT`.
    pub logger_name: String,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub level: Option<log::Level>,
    pub error: Option<ErrorInfo>,
    /// Mapped diagnostic context at the time of the call.
    pub mdc: Attributes,
    pub marker: Option<String>,
    pub call_site: Option<CallSite>,
}

impl LogEvent {
    pub fn new(logger_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            logger_name: logger_name.into(),
            message: Some(message.into()),
            timestamp: Utc::now(),
            level: None,
            error: None,
            mdc: Attributes::new(),
            marker: None,
            call_site: None,
        }
    }

    pub fn with_level(mut self, level: log::Level) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_error<E: Error + 'static>(mut self, err: &E) -> Self {
        self.error = Some(ErrorInfo::capture(err));
        self
    }

    pub fn with_mdc(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.mdc = self.mdc.with(key, value);
        self
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }

    pub fn with_call_site(mut self, call_site: CallSite) -> Self {
        self.call_site = Some(call_site);
        self
    }
}

// ---------------------------------------------------------------------------
// LogRecord
// ---------------------------------------------------------------------------

/// A mapped, structured log record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Instrumentation scope name.
    pub scope: String,
    pub body: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub severity: Option<Severity>,
    pub severity_text: Option<String>,
    pub attributes: Vec<KeyValue>,
    /// Ambient context when the event was mapped.
    pub context: Context,
}

impl LogRecord {
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }

    pub fn attribute_keys(&self) -> impl Iterator<Item = &Key> {
        self.attributes.iter().map(|kv| &kv.key)
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Receives mapped records.
pub trait LogSink: Send + Sync {
    fn emit(&self, record: LogRecord);
}

/// Sink keeping every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn take(&self) -> Vec<LogRecord> {
        std::mem::take(&mut *self.records.lock())
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: LogRecord) {
        self.records.lock().push(record);
    }
}
