//! Worker process entry point.
//!
//! Runs inside the process spawned by the pool: read the context from the
//! handshake KV, execute through the engine, write the result back
//! (resource metrics included even on failure), exit 0. A non-zero exit
//! without a result is how the pool detects a crash.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use bifrost_workflow::execution::WorkerResult;

use crate::engine::{Engine, ExecutionRequest};
use crate::error::EngineError;
use crate::exec::pool::HANDSHAKE_TTL;
use crate::metrics;
use crate::storage::{handshake_keys, HandshakeStore};

/// Run one execution inside this process.
pub async fn run_worker(
    execution_id: Uuid,
    engine: Arc<Engine>,
    handshake: Arc<dyn HandshakeStore>,
) -> Result<(), EngineError> {
    info!(execution_id = %execution_id, "Worker starting");

    // SIGTERM from the pool cancels the execution cooperatively; the pool
    // SIGKILLs after the graceful window if we cannot wind down in time.
    let cancel = CancellationToken::new();
    spawn_sigterm_watcher(cancel.clone());

    let raw_context = handshake
        .get(&handshake_keys::context(execution_id))
        .await?;
    let Some(raw_context) = raw_context else {
        error!(execution_id = %execution_id, "No execution context found");
        write_result(
            &*handshake,
            execution_id,
            &WorkerResult::failure("ContextNotFound", "Execution context not found", 0),
        )
        .await?;
        return Ok(());
    };

    let request: ExecutionRequest = match serde_json::from_str(&raw_context) {
        Ok(request) => request,
        Err(e) => {
            error!(execution_id = %execution_id, error = %e, "Malformed execution context");
            write_result(
                &*handshake,
                execution_id,
                &WorkerResult::failure(
                    "ContextNotFound",
                    format!("Malformed execution context: {e}"),
                    0,
                ),
            )
            .await?;
            return Ok(());
        }
    };

    let usage_start = metrics::snapshot();
    let started = Utc::now();

    let result = engine.execute(request, cancel).await;
    let captured = metrics::capture_since(&usage_start);

    let mut worker_result = result.into_worker_result(Some(captured));
    if worker_result.duration_ms == 0 {
        worker_result.duration_ms = (Utc::now() - started).num_milliseconds();
    }

    write_result(&*handshake, execution_id, &worker_result).await?;

    if let Some(m) = &worker_result.metrics {
        info!(
            execution_id = %execution_id,
            status = %worker_result.status,
            peak_memory_mb = m.peak_memory_bytes / (1024 * 1024),
            cpu_total_seconds = m.cpu_total_seconds,
            "Worker completed"
        );
    } else {
        info!(execution_id = %execution_id, status = %worker_result.status, "Worker completed");
    }
    Ok(())
}

async fn write_result(
    handshake: &dyn HandshakeStore,
    execution_id: Uuid,
    result: &WorkerResult,
) -> Result<(), EngineError> {
    let payload = serde_json::to_string(result)
        .map_err(|e| EngineError::Internal(format!("Failed to serialize worker result: {e}")))?;
    handshake
        .set(
            &handshake_keys::result(execution_id),
            &payload,
            HANDSHAKE_TTL,
        )
        .await?;
    Ok(())
}

#[cfg(unix)]
fn spawn_sigterm_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Worker received SIGTERM, cancelling execution");
                cancel.cancel();
                // Give the engine a moment to observe cancellation; the
                // pool escalates to SIGKILL past its graceful window.
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    });
}

#[cfg(not(unix))]
fn spawn_sigterm_watcher(_cancel: CancellationToken) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Caller;
    use crate::discovery::{handler_fn, WorkflowRegistry};
    use crate::storage::MemoryHandshakeStore;
    use bifrost_workflow::metadata::WorkflowMetadata;
    use bifrost_workflow::status::ExecutionStatus;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn engine() -> Arc<Engine> {
        let registry = Arc::new(WorkflowRegistry::new());
        registry
            .register_workflow(
                WorkflowMetadata::new("sum_two", "Adds two numbers"),
                handler_fn(|_ctx, params| async move {
                    let x = params.get("x").and_then(serde_json::Value::as_i64).unwrap_or(0);
                    let y = params.get("y").and_then(serde_json::Value::as_i64).unwrap_or(0);
                    Ok(json!({"sum": x + y}))
                }),
            )
            .unwrap();
        Arc::new(Engine::new(registry))
    }

    async fn seed_context(
        handshake: &dyn HandshakeStore,
        execution_id: Uuid,
        name: Option<&str>,
    ) {
        let request = ExecutionRequest {
            execution_id,
            caller: Caller {
                user_id: "user-1".into(),
                email: "one@example.com".into(),
                name: "User One".into(),
            },
            organization: None,
            config: BTreeMap::new(),
            name: name.map(String::from),
            code: None,
            tags: vec!["workflow".into()],
            parameters: BTreeMap::from([
                ("x".to_string(), json!(10)),
                ("y".to_string(), json!(32)),
            ]),
            timeout_seconds: 60,
            cache_ttl_seconds: 300,
            transient: true,
            no_cache: false,
            is_platform_admin: false,
        };
        handshake
            .set(
                &handshake_keys::context(execution_id),
                &serde_json::to_string(&request).unwrap(),
                HANDSHAKE_TTL,
            )
            .await
            .unwrap();
    }

    async fn read_result(handshake: &dyn HandshakeStore, execution_id: Uuid) -> WorkerResult {
        let raw = handshake
            .get(&handshake_keys::result(execution_id))
            .await
            .unwrap()
            .expect("worker result written");
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_worker_executes_and_writes_result() {
        let handshake: Arc<dyn HandshakeStore> = Arc::new(MemoryHandshakeStore::new());
        let id = Uuid::new_v4();
        seed_context(&*handshake, id, Some("sum_two")).await;

        run_worker(id, engine(), handshake.clone()).await.unwrap();

        let result = read_result(&*handshake, id).await;
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.result, Some(json!({"sum": 42})));
        assert!(result.metrics.is_some());
    }

    #[tokio::test]
    async fn test_missing_context_reports_context_not_found() {
        let handshake: Arc<dyn HandshakeStore> = Arc::new(MemoryHandshakeStore::new());
        let id = Uuid::new_v4();

        run_worker(id, engine(), handshake.clone()).await.unwrap();

        let result = read_result(&*handshake, id).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error_type.as_deref(), Some("ContextNotFound"));
    }

    #[tokio::test]
    async fn test_unknown_workflow_reports_not_found_with_metrics() {
        let handshake: Arc<dyn HandshakeStore> = Arc::new(MemoryHandshakeStore::new());
        let id = Uuid::new_v4();
        seed_context(&*handshake, id, Some("missing")).await;

        run_worker(id, engine(), handshake.clone()).await.unwrap();

        let result = read_result(&*handshake, id).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error_type.as_deref(), Some("WorkflowNotFound"));
        assert!(result.metrics.is_some());
    }
}
