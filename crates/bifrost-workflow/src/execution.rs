//! Execution records and worker result payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::log::LogEntry;
use crate::status::ExecutionStatus;

/// Scope used when an execution is not bound to an organization.
pub const GLOBAL_SCOPE: &str = "GLOBAL";

/// Resource usage captured by the worker process.
///
/// CPU values are deltas over the execution; peak RSS is cumulative from
/// process start, which for a fresh worker process is the execution itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceMetrics {
    pub peak_memory_bytes: u64,
    pub cpu_user_seconds: f64,
    pub cpu_system_seconds: f64,
    pub cpu_total_seconds: f64,
}

/// How an inline result is rendered (and which blob suffix it spills to).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Json,
    Html,
    Text,
}

impl ResultKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ResultKind::Json => "json",
            ResultKind::Html => "html",
            ResultKind::Text => "txt",
        }
    }

    /// Classify a string result. HTML detection: trimmed content starts
    /// with `<` and contains `>`.
    pub fn detect(value: &Value) -> ResultKind {
        match value {
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.starts_with('<') && trimmed.contains('>') {
                    ResultKind::Html
                } else {
                    ResultKind::Text
                }
            }
            _ => ResultKind::Json,
        }
    }
}

/// The primary execution record.
///
/// Large fields (logs, captured variables, oversized results) are never
/// stored inline; they spill to the blob store and `result_in_blob` flips.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub execution_id: Uuid,
    pub workflow_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_id: Option<String>,
    pub executed_by: String,
    pub executed_by_name: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub input_data: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_type: Option<ResultKind>,
    #[serde(default)]
    pub result_in_blob: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ResourceMetrics>,
}

impl WorkflowExecution {
    /// Partition scope: the organization id, or the GLOBAL literal.
    pub fn scope(&self) -> &str {
        self.org_id.as_deref().unwrap_or(GLOBAL_SCOPE)
    }
}

/// Result payload written by the worker process to the handshake store
/// (`bifrost:exec:{id}:result`) and read once by the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub duration_ms: i64,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub integration_calls: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ResourceMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl WorkerResult {
    /// A failure result with no user output, used when the worker itself
    /// broke (crash, missing context, missing result).
    pub fn failure(
        error_type: impl Into<String>,
        error_message: impl Into<String>,
        duration_ms: i64,
    ) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            result: None,
            duration_ms,
            logs: Vec::new(),
            variables: None,
            integration_calls: Vec::new(),
            error_message: Some(error_message.into()),
            error_type: Some(error_type.into()),
            cached: false,
            cache_expires_at: None,
            metrics: None,
            traceback: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_kind_detection() {
        assert_eq!(ResultKind::detect(&json!({"sum": 42})), ResultKind::Json);
        assert_eq!(ResultKind::detect(&json!([1, 2, 3])), ResultKind::Json);
        assert_eq!(
            ResultKind::detect(&json!("  <html><body>hi</body></html>")),
            ResultKind::Html
        );
        assert_eq!(ResultKind::detect(&json!("< not html")), ResultKind::Text);
        assert_eq!(ResultKind::detect(&json!("plain text")), ResultKind::Text);
    }

    #[test]
    fn test_scope_falls_back_to_global() {
        let mut execution = WorkflowExecution {
            execution_id: Uuid::new_v4(),
            workflow_name: "sum_two".into(),
            org_id: None,
            form_id: None,
            executed_by: "user-1".into(),
            executed_by_name: "User One".into(),
            status: ExecutionStatus::Pending,
            input_data: BTreeMap::new(),
            result: None,
            result_type: None,
            result_in_blob: false,
            error_message: None,
            error_type: None,
            duration_ms: None,
            started_at: Utc::now(),
            completed_at: None,
            metrics: None,
        };
        assert_eq!(execution.scope(), GLOBAL_SCOPE);
        execution.org_id = Some("org-7".into());
        assert_eq!(execution.scope(), "org-7");
    }

    #[test]
    fn test_worker_result_wire_shape() {
        let result = WorkerResult::failure("WorkerCrash", "Worker process exited with code 9", 12);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "Failed");
        assert_eq!(value["error_type"], "WorkerCrash");
        assert_eq!(value["duration_ms"], 12);
        assert!(value.get("result").is_none());
    }
}
