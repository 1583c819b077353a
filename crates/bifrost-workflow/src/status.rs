//! Execution status state machine.

use serde::{Deserialize, Serialize};

/// Status of a workflow or script execution.
///
/// Lifecycle: `Pending` -> `Running` -> one of the terminal statuses.
/// `Cancelling` is a control state set by the cancel API on the record;
/// the queue consumer observes it and drives the transition to `Cancelled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Success,
    CompletedWithErrors,
    Failed,
    Timeout,
    Cancelled,
    Cancelling,
}

impl ExecutionStatus {
    /// Terminal statuses never change again (completed_at/duration_ms frozen).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::CompletedWithErrors
                | ExecutionStatus::Failed
                | ExecutionStatus::Timeout
                | ExecutionStatus::Cancelled
        )
    }

    /// Statuses that keep a row in the status index.
    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "Pending",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Success => "Success",
            ExecutionStatus::CompletedWithErrors => "CompletedWithErrors",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::Timeout => "Timeout",
            ExecutionStatus::Cancelled => "Cancelled",
            ExecutionStatus::Cancelling => "Cancelling",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(ExecutionStatus::Pending),
            "Running" => Some(ExecutionStatus::Running),
            "Success" => Some(ExecutionStatus::Success),
            "CompletedWithErrors" => Some(ExecutionStatus::CompletedWithErrors),
            "Failed" => Some(ExecutionStatus::Failed),
            "Timeout" => Some(ExecutionStatus::Timeout),
            "Cancelled" => Some(ExecutionStatus::Cancelled),
            "Cancelling" => Some(ExecutionStatus::Cancelling),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses_are_not_active() {
        for status in [
            ExecutionStatus::Success,
            ExecutionStatus::CompletedWithErrors,
            ExecutionStatus::Failed,
            ExecutionStatus::Timeout,
            ExecutionStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
            assert!(!status.is_active());
        }
    }

    #[test]
    fn test_cancelling_is_neither_active_nor_terminal() {
        assert!(!ExecutionStatus::Cancelling.is_terminal());
        assert!(!ExecutionStatus::Cancelling.is_active());
    }

    #[test]
    fn test_parse_roundtrip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::CompletedWithErrors,
            ExecutionStatus::Cancelling,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExecutionStatus::parse("NotAStatus"), None);
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&ExecutionStatus::CompletedWithErrors).unwrap();
        assert_eq!(json, "\"CompletedWithErrors\"");
    }
}
