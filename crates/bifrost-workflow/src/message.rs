//! Queue message contract for async executions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Message published by the dispatcher and consumed by the queue consumer.
///
/// Delivery is at-least-once; the consumer relies on the pre-generated
/// `execution_id` and the status pre-check for idempotency. `code` carries a
/// base64-encoded script for inline executions and is absent for named
/// workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMessage {
    pub execution_id: Uuid,
    pub workflow_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    pub user_id: String,
    pub user_name: String,
    pub user_email: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ExecutionMessage {
    pub fn is_script(&self) -> bool {
        self.code.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_roundtrip() {
        let message = ExecutionMessage {
            execution_id: Uuid::new_v4(),
            workflow_name: "sum_two".into(),
            org_id: Some("org-1".into()),
            user_id: "user-1".into(),
            user_name: "User One".into(),
            user_email: "one@example.com".into(),
            parameters: BTreeMap::from([("x".to_string(), json!(10))]),
            form_id: None,
            code: None,
        };
        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: ExecutionMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.execution_id, message.execution_id);
        assert!(!decoded.is_script());
        assert_eq!(decoded.parameters["x"], json!(10));
    }

    #[test]
    fn test_message_tolerates_missing_optionals() {
        let raw = json!({
            "execution_id": Uuid::new_v4(),
            "workflow_name": "inline_script",
            "user_id": "u",
            "user_name": "U",
            "user_email": "u@example.com",
            "code": "cHJpbnQoNDIp"
        });
        let decoded: ExecutionMessage = serde_json::from_value(raw).unwrap();
        assert!(decoded.is_script());
        assert!(decoded.parameters.is_empty());
        assert!(decoded.org_id.is_none());
    }
}
