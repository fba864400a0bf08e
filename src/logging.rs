// Logging sink
//
// Components receive an `Arc<dyn LogSink>` instead of calling the `log`
// macros directly, so tests can observe what was dropped and why.

use log::Level;
use serde_json::Value;

use std::sync::Mutex;

/// Destination for structured log lines
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, message: &str, data: Value);

    fn debug(&self, message: &str, data: Value) {
        self.log(Level::Debug, message, data);
    }

    fn info(&self, message: &str, data: Value) {
        self.log(Level::Info, message, data);
    }

    fn warn(&self, message: &str, data: Value) {
        self.log(Level::Warn, message, data);
    }

    fn error(&self, message: &str, data: Value) {
        self.log(Level::Error, message, data);
    }
}

/// Forwards to the `log` facade (rendered by env_logger in the binary)
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFacade;

impl LogSink for LogFacade {
    fn log(&self, level: Level, message: &str, data: Value) {
        if data.is_null() {
            log::log!(target: "resonance_node", level, "{}", message);
        } else {
            log::log!(target: "resonance_node", level, "{} {}", message, data);
        }
    }
}

/// A single captured log line
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
    pub data: Value,
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    /// Returns a copy of all captured records
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Whether a record at `level` contains `needle` in its message
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.records()
            .iter()
            .any(|record| record.level == level && record.message.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: Level, message: &str, data: Value) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(LogRecord {
                level,
                message: message.to_string(),
                data,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_sink_captures_structured_data() {
        let sink = MemorySink::new();
        sink.warn("dropping message", json!({ "peer": "abc" }));
        sink.info("sealed block", Value::Null);

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data["peer"], "abc");
        assert!(sink.contains(Level::Warn, "dropping"));
        assert!(!sink.contains(Level::Error, "dropping"));
    }
}
