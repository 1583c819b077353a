//! Stuck-execution cleanup.
//!
//! Executions abandoned in Pending or Running (consumer crash, lost
//! broker message, dead worker host) are found through the status index
//! and timed out. Runs on demand and on a fixed timer.

use std::time::Duration;
use tracing::{error, info};

use bifrost_workflow::status::ExecutionStatus;
use bifrost_workflow::WorkflowExecution;

use crate::error::EngineError;
use crate::repository::executions::{
    DEFAULT_PENDING_TIMEOUT_MINUTES, DEFAULT_RUNNING_TIMEOUT_MINUTES,
};
use crate::repository::{ExecutionOutcome, ExecutionRecorder};

/// Outcome of one cleanup pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub cleaned: usize,
    pub pending: usize,
    pub running: usize,
    pub failed: usize,
}

/// Sweeper timing out executions stuck in an active status.
pub struct StuckExecutionSweeper {
    recorder: ExecutionRecorder,
    pending_timeout_minutes: i64,
    running_timeout_minutes: i64,
}

impl StuckExecutionSweeper {
    pub fn new(recorder: ExecutionRecorder) -> Self {
        Self {
            recorder,
            pending_timeout_minutes: DEFAULT_PENDING_TIMEOUT_MINUTES,
            running_timeout_minutes: DEFAULT_RUNNING_TIMEOUT_MINUTES,
        }
    }

    pub fn with_timeouts(mut self, pending_minutes: i64, running_minutes: i64) -> Self {
        self.pending_timeout_minutes = pending_minutes;
        self.running_timeout_minutes = running_minutes;
        self
    }

    /// Stuck executions as display projections, without mutating anything.
    pub async fn find_stuck(&self) -> Result<Vec<WorkflowExecution>, EngineError> {
        Ok(self
            .recorder
            .repository()
            .get_stuck(self.pending_timeout_minutes, self.running_timeout_minutes)
            .await?)
    }

    /// Time out every stuck execution. Failures on individual records are
    /// counted and skipped so one broken row cannot wedge the sweep.
    pub async fn cleanup(&self) -> Result<CleanupReport, EngineError> {
        let stuck = self.find_stuck().await?;
        let mut report = CleanupReport::default();

        for execution in stuck {
            let reason = match execution.status {
                ExecutionStatus::Pending => {
                    report.pending += 1;
                    format!(
                        "Stuck in Pending status for {}+ minutes",
                        self.pending_timeout_minutes
                    )
                }
                ExecutionStatus::Running => {
                    report.running += 1;
                    format!(
                        "Stuck in Running status for {}+ minutes",
                        self.running_timeout_minutes
                    )
                }
                _ => continue,
            };

            info!(
                execution_id = %execution.execution_id,
                workflow = %execution.workflow_name,
                status = %execution.status,
                "Timing out stuck execution"
            );

            let mut outcome = ExecutionOutcome::status(ExecutionStatus::Timeout);
            outcome.error_message = Some(reason);
            outcome.error_type = Some("TimeoutError".to_string());
            if let Err(e) = self
                .recorder
                .update(execution.execution_id, execution.org_id.as_deref(), outcome)
                .await
            {
                error!(
                    execution_id = %execution.execution_id,
                    error = %e,
                    "Failed to time out stuck execution"
                );
                report.failed += 1;
                continue;
            }
            report.cleaned += 1;
        }

        info!(
            cleaned = report.cleaned,
            pending = report.pending,
            running = report.running,
            failed = report.failed,
            "Stuck execution cleanup complete"
        );
        Ok(report)
    }

    /// Fixed-interval sweep loop.
    pub async fn run_timer(&self, interval: Duration) -> Result<(), EngineError> {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.cleanup().await {
                error!(error = %e, "Stuck execution sweep failed");
            }
        }
    }
}
