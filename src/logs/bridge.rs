//! `log` facade backend that maps every record through [`LogEventMapper`].

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use super::{CallSite, LogEvent, LogEventMapper, LogSink, MapperConfig};

/// Logger forwarding `log` records to a [`LogSink`].
///
/// The diagnostic attributes of the current context become the event's MDC,
/// so values a fiber set on its context show up on the records it logs.
#[derive(Debug)]
pub struct ContextLogger<S> {
    mapper: LogEventMapper,
    sink: S,
    level: LevelFilter,
}

impl<S: LogSink + 'static> ContextLogger<S> {
    pub fn new(sink: S) -> Self {
        Self::with_mapper(LogEventMapper::new(MapperConfig::default()), sink)
    }

    pub fn with_mapper(mapper: LogEventMapper, sink: S) -> Self {
        Self {
            mapper,
            sink,
            level: LevelFilter::Trace,
        }
    }

    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Install as the global `log` backend.
    pub fn install(self) -> Result<(), SetLoggerError> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }

    fn to_event(&self, record: &Record<'_>) -> LogEvent {
        let mut event = LogEvent::new(record.target(), record.args().to_string())
            .with_level(record.level());
        event.mdc = self.mapper.storage().current().attributes().clone();
        event.call_site = Some(CallSite {
            file: record.file().map(str::to_owned),
            namespace: record
                .module_path()
                .unwrap_or_else(|| record.target())
                .to_string(),
            function: None,
            line: record.line().unwrap_or(0),
        });
        event
    }
}

impl<S: LogSink + 'static> Log for ContextLogger<S> {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let event = self.to_event(record);
        self.mapper.emit(&self.sink, &event);
    }

    fn flush(&self) {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::fiber::FiberContextHandle;
    use crate::logs::MemorySink;
    use crate::storage::ContextRegistry;
    use opentelemetry::logs::Severity;
    use opentelemetry::Value;
    use std::sync::Arc;

    fn emit(logger: &ContextLogger<MemorySink>, level: log::Level, message: &str) {
        logger.log(
            &Record::builder()
                .args(format_args!("{}", message))
                .level(level)
                .target("app.worker")
                .module_path(Some("app::worker"))
                .file(Some("src/worker.rs"))
                .line(Some(12))
                .build(),
        );
    }

    #[test]
    fn test_records_carry_context_attributes_as_mdc() {
        let _ = env_logger::builder().is_test(true).try_init();
        let registry = ContextRegistry::new();
        let carrier = registry.spawn_carrier();
        let mapper = LogEventMapper::with_storage(
            MapperConfig {
                capture_mdc_attributes: vec!["*".into()],
                capture_code_attributes: true,
                ..MapperConfig::default()
            },
            Arc::new(carrier.clone()),
        );
        let logger = ContextLogger::with_mapper(mapper, MemorySink::new());

        let mut fiber =
            FiberContextHandle::with_context(Context::root().with_attribute("request", "r-42"));
        fiber
            .run_slice(&carrier, || emit(&logger, log::Level::Info, "handled"))
            .unwrap();
        emit(&logger, log::Level::Info, "idle");

        let records = logger.sink().take();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].scope, "app.worker");
        assert_eq!(records[0].body.as_deref(), Some("handled"));
        assert_eq!(records[0].severity, Some(Severity::Info));
        assert_eq!(
            records[0].attribute("log.mdc.request"),
            Some(&Value::from("r-42".to_string()))
        );
        assert_eq!(records[0].attribute("code.lineno"), Some(&Value::I64(12)));
        assert!(records[1].attribute("log.mdc.request").is_none());
    }

    #[test]
    fn test_level_filter_drops_verbose_records() {
        let logger = ContextLogger::new(MemorySink::new()).with_level(LevelFilter::Warn);
        emit(&logger, log::Level::Debug, "noise");
        emit(&logger, log::Level::Error, "boom");

        let records = logger.sink().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].severity_text.as_deref(), Some("ERROR"));
    }
}
