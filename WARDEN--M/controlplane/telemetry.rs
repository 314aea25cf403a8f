use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::Handle;

/// Builder for control-plane telemetry sinks.
pub struct ControlTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl ControlTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            event_publisher: None,
        }
    }

    /// Sets the JSON-lines log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<ControlTelemetry> {
        let logger = self.log_path.map(JsonLogger::new).transpose()?;
        Ok(ControlTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Telemetry handle shared by the pipeline, poller and service.
#[derive(Clone)]
pub struct ControlTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for ControlTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlTelemetry")
            .field("module", &self.inner.module)
            .field("logger", &self.inner.logger.as_ref().map(JsonLogger::path))
            .field("events", &self.inner.publisher.is_some())
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl ControlTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> ControlTelemetryBuilder {
        ControlTelemetryBuilder::new(module)
    }

    /// Writes a structured log record.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Publishes an event. Inside a runtime the publish is spawned; outside it blocks.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        let Some(publisher) = &self.inner.publisher else {
            return Ok(());
        };
        let record = EventRecord::new(&self.inner.module, event_type, payload);
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    tracing::warn!(error = %err, "telemetry event publish failed");
                }
            });
            Ok(())
        } else {
            futures::executor::block_on(publisher.publish(record))
        }
    }

    /// Logs and publishes the same payload under `name`.
    pub fn emit(&self, level: LogLevel, name: &str, payload: Value) -> Result<()> {
        self.log(level, name, payload.clone())?;
        self.event(name, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log_and_event_outside_runtime() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("controlplane.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = ControlTelemetry::builder("controlplane")
            .log_path(&path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .emit(
                LogLevel::Info,
                "controlplane.command.accepted",
                json!({ "line": 3 }),
            )
            .unwrap();
        let records = JsonLogger::read_records(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "controlplane.command.accepted");
        assert_eq!(bus.of_type("controlplane.command.accepted").len(), 1);
    }

    #[tokio::test]
    async fn events_are_spawned_inside_runtime() {
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = ControlTelemetry::builder("controlplane")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .event("controlplane.command.completed", json!({}))
            .unwrap();
        for _ in 0..50 {
            if !bus.snapshot().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(bus.snapshot().len(), 1);
    }
}
