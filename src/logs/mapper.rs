//! Mapping of [`LogEvent`]s onto [`LogRecord`]s.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use opentelemetry::logs::Severity;
use opentelemetry::{Key, KeyValue};
use serde::{Deserialize, Serialize};

use crate::context::Attributes;
use crate::storage::{ContextStorage, ThreadLocalStorage};

use super::{LogEvent, LogRecord, LogSink};

/// Scope name used when an event has no logger name.
pub const ROOT_SCOPE: &str = "ROOT";

const MDC_KEY_CACHE_LIMIT: usize = 100;

static MDC_ATTRIBUTE_KEYS: Lazy<DashMap<String, Key>> = Lazy::new(DashMap::new);

const LOG_MARKER: &str = "log.marker";
const EXCEPTION_TYPE: &str = "exception.type";
const EXCEPTION_MESSAGE: &str = "exception.message";
const EXCEPTION_STACKTRACE: &str = "exception.stacktrace";
const THREAD_NAME: &str = "thread.name";
const THREAD_ID: &str = "thread.id";
const CODE_FILEPATH: &str = "code.filepath";
const CODE_NAMESPACE: &str = "code.namespace";
const CODE_FUNCTION: &str = "code.function";
const CODE_LINENO: &str = "code.lineno";

/// Which optional attributes the mapper captures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Capture `thread.name` and `thread.id` (the carrier id).
    pub capture_experimental_attributes: bool,
    /// MDC keys to capture. Exactly `["*"]` captures every key.
    pub capture_mdc_attributes: Vec<String>,
    /// Capture `code.*` attributes from the call site.
    pub capture_code_attributes: bool,
    /// Capture `log.marker`.
    pub capture_marker_attribute: bool,
}

/// Maps log events to records, reading the ambient context at mapping time.
pub struct LogEventMapper {
    config: MapperConfig,
    capture_all_mdc: bool,
    storage: Arc<dyn ContextStorage>,
}

impl LogEventMapper {
    /// Mapper reading the context of the calling OS thread.
    pub fn new(config: MapperConfig) -> Self {
        Self::with_storage(config, Arc::new(ThreadLocalStorage))
    }

    pub fn with_storage(config: MapperConfig, storage: Arc<dyn ContextStorage>) -> Self {
        let capture_all_mdc =
            config.capture_mdc_attributes.len() == 1 && config.capture_mdc_attributes[0] == "*";
        Self {
            config,
            capture_all_mdc,
            storage,
        }
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    pub(crate) fn storage(&self) -> &dyn ContextStorage {
        self.storage.as_ref()
    }

    /// Map `event` and hand the record to `sink`.
    pub fn emit(&self, sink: &dyn LogSink, event: &LogEvent) {
        sink.emit(self.map(event));
    }

    pub fn map(&self, event: &LogEvent) -> LogRecord {
        let scope = if event.logger_name.is_empty() {
            ROOT_SCOPE.to_string()
        } else {
            event.logger_name.clone()
        };

        let mut attributes = Vec::new();

        if let Some(error) = &event.error {
            attributes.push(KeyValue::new(EXCEPTION_TYPE, error.type_name.clone()));
            attributes.push(KeyValue::new(EXCEPTION_MESSAGE, error.message.clone()));
            attributes.push(KeyValue::new(EXCEPTION_STACKTRACE, error.stacktrace.clone()));
        }

        self.capture_mdc_attributes(&mut attributes, &event.mdc);

        if self.config.capture_experimental_attributes {
            if let Some(name) = std::thread::current().name() {
                attributes.push(KeyValue::new(THREAD_NAME, name.to_string()));
            }
            let carrier = self.storage.carrier_id().as_u64();
            attributes.push(KeyValue::new(THREAD_ID, carrier as i64));
        }

        if self.config.capture_code_attributes {
            if let Some(site) = &event.call_site {
                if let Some(file) = &site.file {
                    attributes.push(KeyValue::new(CODE_FILEPATH, file.clone()));
                }
                attributes.push(KeyValue::new(CODE_NAMESPACE, site.namespace.clone()));
                if let Some(function) = &site.function {
                    attributes.push(KeyValue::new(CODE_FUNCTION, function.clone()));
                }
                if site.line > 0 {
                    attributes.push(KeyValue::new(CODE_LINENO, i64::from(site.line)));
                }
            }
        }

        if self.config.capture_marker_attribute {
            if let Some(marker) = &event.marker {
                attributes.push(KeyValue::new(LOG_MARKER, marker.clone()));
            }
        }

        LogRecord {
            scope,
            body: event.message.clone(),
            timestamp: event.timestamp,
            severity: event.level.map(level_to_severity),
            severity_text: event.level.map(|level| level.as_str().to_string()),
            attributes,
            context: self.storage.current(),
        }
    }

    fn capture_mdc_attributes(&self, attributes: &mut Vec<KeyValue>, mdc: &Attributes) {
        if self.capture_all_mdc {
            for (key, value) in mdc.iter() {
                attributes.push(KeyValue::new(mdc_attribute_key(key), value.to_string()));
            }
            return;
        }

        for key in &self.config.capture_mdc_attributes {
            if let Some(value) = mdc.get(key) {
                attributes.push(KeyValue::new(mdc_attribute_key(key), value.to_string()));
            }
        }
    }
}

impl std::fmt::Debug for LogEventMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEventMapper")
            .field("config", &self.config)
            .field("capture_all_mdc", &self.capture_all_mdc)
            .finish()
    }
}

/// Attribute key for MDC entry `key`: `log.mdc.<key>`.
///
/// The first hundred distinct keys are interned.
pub fn mdc_attribute_key(key: &str) -> Key {
    if let Some(cached) = MDC_ATTRIBUTE_KEYS.get(key) {
        return cached.clone();
    }
    let attribute = Key::from(format!("log.mdc.{}", key));
    if MDC_ATTRIBUTE_KEYS.len() < MDC_KEY_CACHE_LIMIT {
        MDC_ATTRIBUTE_KEYS.insert(key.to_string(), attribute.clone());
    }
    attribute
}

fn level_to_severity(level: log::Level) -> Severity {
    match level {
        log::Level::Trace => Severity::Trace,
        log::Level::Debug => Severity::Debug,
        log::Level::Info => Severity::Info,
        log::Level::Warn => Severity::Warn,
        log::Level::Error => Severity::Error,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
