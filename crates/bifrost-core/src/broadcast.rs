//! Real-time broadcast events and the transport seam.
//!
//! Two groups exist per execution: `execution:{id}` feeds detail views with
//! per-log updates, `history:{scope}` feeds list views with status changes.
//! Broadcast failures are logged and never fail the execution.

use async_trait::async_trait;
use bifrost_workflow::log::LogEntry;
use bifrost_workflow::status::ExecutionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

/// Event type names on the wire.
pub const EXECUTION_UPDATE_EVENT: &str = "executionUpdate";
pub const HISTORY_UPDATE_EVENT: &str = "executionHistoryUpdate";

/// Detail views never receive more than this many logs per event.
pub const MAX_LOGS_PER_UPDATE: usize = 50;

pub fn execution_group(execution_id: Uuid) -> String {
    format!("execution:{execution_id}")
}

pub fn history_group(scope: &str) -> String {
    format!("history:{scope}")
}

/// Payload for the `execution:{id}` group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionUpdate {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub is_complete: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_logs: Option<Vec<LogEntry>>,
}

impl ExecutionUpdate {
    pub fn new(execution_id: Uuid, status: ExecutionStatus, latest_logs: Option<Vec<LogEntry>>) -> Self {
        let latest_logs = latest_logs.map(|logs| {
            let skip = logs.len().saturating_sub(MAX_LOGS_PER_UPDATE);
            logs.into_iter().skip(skip).collect()
        });
        Self {
            execution_id,
            status,
            is_complete: status.is_terminal(),
            timestamp: Utc::now(),
            latest_logs,
        }
    }
}

/// Payload for the `history:{scope}` group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryUpdate {
    #[serde(skip)]
    pub scope: String,
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub executed_by: String,
    pub executed_by_name: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// A group-addressed event as handed to the transport.
#[derive(Debug, Clone)]
pub struct BroadcastEnvelope {
    pub group: String,
    pub event: &'static str,
    pub payload: Value,
}

/// Transport seam. The production pub/sub service is an external
/// collaborator; implementations must swallow their own failures.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast_execution_update(&self, update: ExecutionUpdate);

    async fn broadcast_history_update(&self, update: HistoryUpdate);
}

/// Broadcaster that drops everything (workers, tests).
#[derive(Default)]
pub struct NoopBroadcaster;

#[async_trait]
impl Broadcaster for NoopBroadcaster {
    async fn broadcast_execution_update(&self, _update: ExecutionUpdate) {}

    async fn broadcast_history_update(&self, _update: HistoryUpdate) {}
}

/// In-process fan-out over a tokio broadcast channel, used by local
/// subscribers (websocket bridges, tests).
pub struct ChannelBroadcaster {
    sender: tokio::sync::broadcast::Sender<BroadcastEnvelope>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BroadcastEnvelope> {
        self.sender.subscribe()
    }

    fn send(&self, envelope: BroadcastEnvelope) {
        // A send error only means there are no subscribers right now.
        if self.sender.send(envelope).is_err() {
            warn!("Broadcast dropped: no subscribers");
        }
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Broadcaster for ChannelBroadcaster {
    async fn broadcast_execution_update(&self, update: ExecutionUpdate) {
        match serde_json::to_value(&update) {
            Ok(payload) => self.send(BroadcastEnvelope {
                group: execution_group(update.execution_id),
                event: EXECUTION_UPDATE_EVENT,
                payload,
            }),
            Err(e) => warn!(error = %e, "Failed to serialize execution update"),
        }
    }

    async fn broadcast_history_update(&self, update: HistoryUpdate) {
        match serde_json::to_value(&update) {
            Ok(payload) => self.send(BroadcastEnvelope {
                group: history_group(&update.scope),
                event: HISTORY_UPDATE_EVENT,
                payload,
            }),
            Err(e) => warn!(error = %e, "Failed to serialize history update"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bifrost_workflow::log::{LogLevel, LogSource};

    #[test]
    fn test_group_names() {
        let id = Uuid::new_v4();
        assert_eq!(execution_group(id), format!("execution:{id}"));
        assert_eq!(history_group("org-1"), "history:org-1");
    }

    #[test]
    fn test_update_caps_latest_logs() {
        let id = Uuid::new_v4();
        let logs: Vec<LogEntry> = (1..=60)
            .map(|i| LogEntry::new(id, i, LogLevel::Info, format!("line {i}"), LogSource::Workflow))
            .collect();
        let update = ExecutionUpdate::new(id, ExecutionStatus::Running, Some(logs));
        let latest = update.latest_logs.unwrap();
        assert_eq!(latest.len(), MAX_LOGS_PER_UPDATE);
        assert_eq!(latest.first().unwrap().sequence, 11);
        assert!(!update.is_complete);
    }

    #[tokio::test]
    async fn test_channel_broadcaster_fans_out() {
        let broadcaster = ChannelBroadcaster::default();
        let mut rx = broadcaster.subscribe();
        let id = Uuid::new_v4();
        broadcaster
            .broadcast_execution_update(ExecutionUpdate::new(id, ExecutionStatus::Success, None))
            .await;
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event, EXECUTION_UPDATE_EVENT);
        assert_eq!(envelope.group, execution_group(id));
        assert_eq!(envelope.payload["isComplete"], serde_json::json!(true));
    }
}
