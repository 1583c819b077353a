//! Per-execution log entries.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Log severity. `Traceback` is an admin-only level used for full error
/// chains; non-admin viewers never see it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Traceback,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Traceback => "TRACEBACK",
        }
    }

    /// Levels hidden from non-admin callers.
    pub fn is_admin_only(&self) -> bool {
        matches!(self, LogLevel::Debug | LogLevel::Traceback)
    }
}

/// Where a log line originated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Workflow,
    Script,
    System,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Workflow => "workflow",
            LogSource::Script => "script",
            LogSource::System => "system",
        }
    }
}

/// A single log line emitted during an execution.
///
/// `sequence` is assigned under a per-execution monotonic counter before the
/// entry is persisted or broadcast, so persisted order equals broadcast
/// order. `execution_log_id` exists for client-side deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub execution_log_id: Uuid,
    pub execution_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub sequence: u32,
    pub level: LogLevel,
    pub message: String,
    pub source: LogSource,
}

impl LogEntry {
    pub fn new(
        execution_id: Uuid,
        sequence: u32,
        level: LogLevel,
        message: impl Into<String>,
        source: LogSource,
    ) -> Self {
        Self {
            execution_log_id: Uuid::new_v4(),
            execution_id,
            timestamp: Utc::now(),
            sequence,
            level,
            message: message.into(),
            source,
        }
    }

    /// Row key for the log table: `{iso_timestamp}-{sequence:04}`.
    ///
    /// Natural string ordering is chronological, and the sequence suffix
    /// de-collides entries written within the same microsecond tick.
    pub fn row_key(&self) -> String {
        format!(
            "{}-{:04}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.sequence
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_key_orders_same_instant_by_sequence() {
        let id = Uuid::new_v4();
        let ts = Utc::now();
        let mut a = LogEntry::new(id, 1, LogLevel::Info, "first", LogSource::Workflow);
        let mut b = LogEntry::new(id, 2, LogLevel::Info, "second", LogSource::Workflow);
        a.timestamp = ts;
        b.timestamp = ts;
        assert!(a.row_key() < b.row_key());
    }

    #[test]
    fn test_level_visibility() {
        assert!(LogLevel::Debug.is_admin_only());
        assert!(LogLevel::Traceback.is_admin_only());
        assert!(!LogLevel::Info.is_admin_only());
        assert!(!LogLevel::Error.is_admin_only());
    }

    #[test]
    fn test_serde_wire_format() {
        let entry = LogEntry::new(
            Uuid::new_v4(),
            3,
            LogLevel::Warning,
            "careful",
            LogSource::Script,
        );
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["level"], "WARNING");
        assert_eq!(value["source"], "script");
        assert_eq!(value["sequence"], 3);
        assert!(value["executionLogId"].is_string());
    }
}
