//! Execution backends.
//!
//! The queue consumer drives executions through the [`ExecutionBackend`]
//! seam: the process pool is the authoritative implementation for queued
//! work, and [`InProcessRunner`] is the sync-execution path (and test
//! double). Cancellation and timeout semantics live here, not in the
//! engine.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use bifrost_workflow::execution::WorkerResult;

use crate::engine::{Engine, ExecutionRequest};
use crate::error::EngineError;
use crate::metrics;

/// External cancellation probe, polled on the monitor interval. The
/// consumer's probe re-reads the record status and reports Cancelling.
#[async_trait]
pub trait CancelProbe: Send + Sync {
    async fn is_cancel_requested(&self) -> bool;
}

/// Probe that never cancels (sync path, tests).
pub struct NeverCancelled;

#[async_trait]
impl CancelProbe for NeverCancelled {
    async fn is_cancel_requested(&self) -> bool {
        false
    }
}

/// Seam between the consumer and whatever actually runs the execution.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Run to completion, honoring `timeout_seconds` and the probe.
    /// Cancellation and timeout surface as [`EngineError::Cancelled`] and
    /// [`EngineError::Timeout`]; everything else comes back as a
    /// [`WorkerResult`].
    async fn execute(
        &self,
        request: ExecutionRequest,
        timeout_seconds: u64,
        on_cancel: Arc<dyn CancelProbe>,
    ) -> Result<WorkerResult, EngineError>;

    async fn cancel(&self, execution_id: Uuid) -> Result<(), EngineError>;
}

/// Runs the engine inside the current process, with cooperative
/// cancellation through the request's token. User code that blocks without
/// suspension points cannot be interrupted here; that hard guarantee
/// belongs to the process pool.
pub struct InProcessRunner {
    engine: Arc<Engine>,
    check_interval: Duration,
}

impl InProcessRunner {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            check_interval: Duration::from_millis(250),
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }
}

#[async_trait]
impl ExecutionBackend for InProcessRunner {
    async fn execute(
        &self,
        request: ExecutionRequest,
        timeout_seconds: u64,
        on_cancel: Arc<dyn CancelProbe>,
    ) -> Result<WorkerResult, EngineError> {
        let execution_id = request.execution_id;
        let token = CancellationToken::new();
        let usage_start = metrics::snapshot();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_seconds);

        let engine = self.engine.clone();
        let exec_token = token.clone();
        let mut task = Box::pin(engine.execute(request, exec_token));
        let mut interval = tokio::time::interval(self.check_interval);

        loop {
            tokio::select! {
                result = &mut task => {
                    let captured = metrics::capture_since(&usage_start);
                    return Ok(result.into_worker_result(Some(captured)));
                }
                _ = interval.tick() => {
                    if on_cancel.is_cancel_requested().await {
                        info!(execution_id = %execution_id, "Cancellation requested, stopping in-process execution");
                        token.cancel();
                        return Err(EngineError::Cancelled);
                    }
                    if tokio::time::Instant::now() >= deadline {
                        info!(execution_id = %execution_id, timeout_seconds, "In-process execution timed out");
                        token.cancel();
                        return Err(EngineError::Timeout(timeout_seconds));
                    }
                }
            }
        }
    }

    async fn cancel(&self, _execution_id: Uuid) -> Result<(), EngineError> {
        // In-process executions are cancelled through the consumer's probe.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Caller;
    use crate::discovery::{handler_fn, WorkflowRegistry};
    use bifrost_workflow::metadata::WorkflowMetadata;
    use bifrost_workflow::status::ExecutionStatus;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn request(name: &str) -> ExecutionRequest {
        ExecutionRequest {
            execution_id: Uuid::new_v4(),
            caller: Caller {
                user_id: "user-1".into(),
                email: "one@example.com".into(),
                name: "User One".into(),
            },
            organization: None,
            config: BTreeMap::new(),
            name: Some(name.to_string()),
            code: None,
            tags: vec!["workflow".to_string()],
            parameters: BTreeMap::new(),
            timeout_seconds: 60,
            cache_ttl_seconds: 300,
            transient: true,
            no_cache: false,
            is_platform_admin: false,
        }
    }

    fn engine_with(name: &str, sleep_ms: u64) -> Arc<Engine> {
        let registry = Arc::new(WorkflowRegistry::new());
        registry
            .register_workflow(
                WorkflowMetadata::new(name, "test workflow"),
                handler_fn(move |ctx, _params| async move {
                    let token = ctx.cancellation_token();
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                        _ = token.cancelled() => {}
                    }
                    Ok(json!({"done": true}))
                }),
            )
            .unwrap();
        Arc::new(Engine::new(registry))
    }

    struct AlwaysCancelled;

    #[async_trait]
    impl CancelProbe for AlwaysCancelled {
        async fn is_cancel_requested(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_normal_completion_reports_metrics() {
        let runner = InProcessRunner::new(engine_with("quick", 1));
        let result = runner
            .execute(request("quick"), 60, Arc::new(NeverCancelled))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert!(result.metrics.is_some());
    }

    #[tokio::test]
    async fn test_probe_cancellation_surfaces_as_cancelled() {
        let runner = InProcessRunner::new(engine_with("slow", 10_000))
            .with_check_interval(Duration::from_millis(10));
        let result = runner
            .execute(request("slow"), 60, Arc::new(AlwaysCancelled))
            .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_surfaces_as_timeout() {
        let runner = InProcessRunner::new(engine_with("sleepy", 120_000));
        let result = runner
            .execute(request("sleepy"), 1, Arc::new(NeverCancelled))
            .await;
        assert!(matches!(result, Err(EngineError::Timeout(1))));
    }
}
