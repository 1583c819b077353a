//! Process-isolated execution backend.
//!
//! Each queued execution runs in a freshly spawned worker process. Context
//! and result travel through the TTL-bounded handshake KV; control travels
//! through signals: cancellation or timeout sends SIGTERM, waits out a
//! bounded graceful window, then SIGKILLs. Blocking user code that ignores
//! cooperative cancellation is therefore still stopped in bounded time.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};
use uuid::Uuid;

use bifrost_workflow::execution::WorkerResult;

use crate::engine::ExecutionRequest;
use crate::error::EngineError;
use crate::exec::runner::{CancelProbe, ExecutionBackend};
use crate::storage::{handshake_keys, HandshakeStore};

/// TTL on every handshake entry.
pub const HANDSHAKE_TTL: Duration = Duration::from_secs(3600);

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct ProcessPoolConfig {
    /// Program spawned per execution; invoked as
    /// `{program} worker {execution_id}`.
    pub worker_program: PathBuf,
    pub graceful_shutdown_seconds: u64,
    pub cancel_check_interval_ms: u64,
}

impl ProcessPoolConfig {
    pub fn from_current_exe() -> std::io::Result<Self> {
        Ok(Self {
            worker_program: std::env::current_exe()?,
            graceful_shutdown_seconds: 3,
            cancel_check_interval_ms: 250,
        })
    }
}

/// Pool of per-execution worker processes.
pub struct ProcessPool {
    handshake: Arc<dyn HandshakeStore>,
    config: ProcessPoolConfig,
    running: DashMap<Uuid, u32>,
}

impl ProcessPool {
    pub fn new(handshake: Arc<dyn HandshakeStore>, config: ProcessPoolConfig) -> Self {
        Self {
            handshake,
            config,
            running: DashMap::new(),
        }
    }

    async fn write_context(&self, request: &ExecutionRequest) -> Result<(), EngineError> {
        let payload = serde_json::to_string(request)
            .map_err(|e| EngineError::Internal(format!("Failed to serialize context: {e}")))?;
        self.handshake
            .set(
                &handshake_keys::context(request.execution_id),
                &payload,
                HANDSHAKE_TTL,
            )
            .await?;
        Ok(())
    }

    async fn read_result(&self, execution_id: Uuid) -> Result<Option<WorkerResult>, EngineError> {
        match self
            .handshake
            .get(&handshake_keys::result(execution_id))
            .await?
        {
            Some(payload) => Ok(Some(serde_json::from_str(&payload).map_err(|e| {
                EngineError::Internal(format!("Malformed worker result: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    async fn set_cancel_flag(&self, execution_id: Uuid) -> Result<(), EngineError> {
        self.handshake
            .set(&handshake_keys::cancel(execution_id), "1", HANDSHAKE_TTL)
            .await?;
        Ok(())
    }

    /// SIGTERM, graceful window, then SIGKILL if the worker is still alive.
    async fn stop_worker(&self, execution_id: Uuid, child: &mut Child) {
        if let Some(pid) = child.id() {
            info!(execution_id = %execution_id, pid, "Sending SIGTERM to worker");
            send_signal(pid, libc::SIGTERM);
        }
        tokio::time::sleep(Duration::from_secs(self.config.graceful_shutdown_seconds)).await;
        if matches!(child.try_wait(), Ok(None)) {
            if let Some(pid) = child.id() {
                warn!(execution_id = %execution_id, pid, "Worker survived graceful window, sending SIGKILL");
                send_signal(pid, libc::SIGKILL);
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
        }
    }

    async fn monitor(
        &self,
        request: &ExecutionRequest,
        timeout_seconds: u64,
        on_cancel: Arc<dyn CancelProbe>,
        child: &mut Child,
    ) -> Result<WorkerResult, EngineError> {
        let execution_id = request.execution_id;
        let started = tokio::time::Instant::now();
        let deadline = started + Duration::from_secs(timeout_seconds);
        let interval = Duration::from_millis(self.config.cancel_check_interval_ms);

        let exit_status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|e| {
                        EngineError::Internal(format!("Failed to await worker: {e}"))
                    })?;
                }
                _ = tokio::time::sleep(interval) => {
                    if on_cancel.is_cancel_requested().await {
                        info!(execution_id = %execution_id, "External cancellation requested");
                        let _ = self.set_cancel_flag(execution_id).await;
                        self.stop_worker(execution_id, child).await;
                        return Err(EngineError::Cancelled);
                    }
                    if self
                        .handshake
                        .exists(&handshake_keys::cancel(execution_id))
                        .await
                        .unwrap_or(false)
                    {
                        info!(execution_id = %execution_id, "Cancel flag set via API");
                        self.stop_worker(execution_id, child).await;
                        return Err(EngineError::Cancelled);
                    }
                    if tokio::time::Instant::now() >= deadline {
                        warn!(
                            execution_id = %execution_id,
                            timeout_seconds,
                            "Execution exceeded timeout"
                        );
                        self.stop_worker(execution_id, child).await;
                        return Err(EngineError::Timeout(timeout_seconds));
                    }
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        match self.read_result(execution_id).await? {
            Some(result) => Ok(result),
            None => {
                let code = exit_status.code().unwrap_or(-1);
                if code != 0 {
                    Ok(WorkerResult::failure(
                        "WorkerCrash",
                        format!("Worker process exited with code {code}"),
                        duration_ms,
                    ))
                } else {
                    Ok(WorkerResult::failure(
                        "NoResult",
                        "Worker completed but no result found",
                        duration_ms,
                    ))
                }
            }
        }
    }

    async fn cleanup(&self, execution_id: Uuid, child: &mut Child) {
        self.running.remove(&execution_id);

        if matches!(child.try_wait(), Ok(None)) {
            if let Some(pid) = child.id() {
                send_signal(pid, libc::SIGTERM);
            }
            if tokio::time::timeout(Duration::from_secs(1), child.wait())
                .await
                .is_err()
            {
                if let Some(pid) = child.id() {
                    send_signal(pid, libc::SIGKILL);
                }
            }
        }

        if let Err(e) = self
            .handshake
            .delete(&handshake_keys::all(execution_id))
            .await
        {
            warn!(execution_id = %execution_id, error = %e, "Failed to clean up handshake keys");
        }
    }

    /// Terminate every running worker.
    pub async fn shutdown(&self) {
        let pids: Vec<(Uuid, u32)> = self
            .running
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        for (execution_id, pid) in &pids {
            info!(execution_id = %execution_id, pid, "Shutting down worker");
            send_signal(*pid, libc::SIGTERM);
        }
        tokio::time::sleep(Duration::from_secs(self.config.graceful_shutdown_seconds)).await;
        for (_, pid) in pids {
            send_signal(pid, libc::SIGKILL);
        }
    }
}

#[async_trait]
impl ExecutionBackend for ProcessPool {
    async fn execute(
        &self,
        request: ExecutionRequest,
        timeout_seconds: u64,
        on_cancel: Arc<dyn CancelProbe>,
    ) -> Result<WorkerResult, EngineError> {
        let execution_id = request.execution_id;
        self.write_context(&request).await?;

        let id_string = execution_id.to_string();
        let mut child = Command::new(&self.config.worker_program)
            .arg("worker")
            .arg(&id_string)
            // Short id in argv for operator readability in process listings.
            .arg(format!("--label=worker-{}", &id_string[..8]))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Internal(format!("Failed to spawn worker: {e}")))?;

        if let Some(pid) = child.id() {
            info!(execution_id = %execution_id, pid, "Started worker process");
            self.running.insert(execution_id, pid);
        }

        let outcome = self
            .monitor(&request, timeout_seconds, on_cancel, &mut child)
            .await;
        self.cleanup(execution_id, &mut child).await;
        outcome
    }

    async fn cancel(&self, execution_id: Uuid) -> Result<(), EngineError> {
        self.set_cancel_flag(execution_id).await?;
        if let Some(entry) = self.running.get(&execution_id) {
            let pid = *entry.value();
            drop(entry);
            send_signal(pid, libc::SIGTERM);
            tokio::time::sleep(Duration::from_secs(self.config.graceful_shutdown_seconds)).await;
            // The monitor loop reaps the process; this is belt-and-braces
            // for workers that ignored SIGTERM.
            if self.running.contains_key(&execution_id) {
                send_signal(pid, libc::SIGKILL);
            }
        }
        Ok(())
    }
}

fn send_signal(pid: u32, signal: i32) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryHandshakeStore;
    use crate::context::Caller;
    use std::collections::BTreeMap;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            execution_id: Uuid::new_v4(),
            caller: Caller {
                user_id: "user-1".into(),
                email: "one@example.com".into(),
                name: "User One".into(),
            },
            organization: None,
            config: BTreeMap::new(),
            name: Some("sum_two".into()),
            code: None,
            tags: vec!["workflow".into()],
            parameters: BTreeMap::new(),
            timeout_seconds: 60,
            cache_ttl_seconds: 300,
            transient: false,
            no_cache: false,
            is_platform_admin: false,
        }
    }

    #[tokio::test]
    async fn test_context_roundtrips_through_handshake() {
        let handshake: Arc<dyn HandshakeStore> = Arc::new(MemoryHandshakeStore::new());
        let pool = ProcessPool::new(
            handshake.clone(),
            ProcessPoolConfig {
                worker_program: PathBuf::from("/bin/true"),
                graceful_shutdown_seconds: 1,
                cancel_check_interval_ms: 50,
            },
        );

        let req = request();
        pool.write_context(&req).await.unwrap();
        let raw = handshake
            .get(&handshake_keys::context(req.execution_id))
            .await
            .unwrap()
            .expect("context written");
        let parsed: ExecutionRequest = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.execution_id, req.execution_id);
        assert_eq!(parsed.name.as_deref(), Some("sum_two"));
    }

    #[tokio::test]
    async fn test_worker_exit_zero_without_result_is_no_result() {
        // /bin/true ignores its arguments and exits 0 without ever writing
        // a result entry.
        let handshake: Arc<dyn HandshakeStore> = Arc::new(MemoryHandshakeStore::new());
        let pool = ProcessPool::new(
            handshake.clone(),
            ProcessPoolConfig {
                worker_program: PathBuf::from("/bin/true"),
                graceful_shutdown_seconds: 1,
                cancel_check_interval_ms: 20,
            },
        );

        let req = request();
        let execution_id = req.execution_id;
        let result = pool
            .execute(req, 30, Arc::new(crate::exec::runner::NeverCancelled))
            .await
            .unwrap();
        assert_eq!(result.error_type.as_deref(), Some("NoResult"));

        // Handshake keys are cleaned up afterwards.
        assert!(handshake
            .get(&handshake_keys::context(execution_id))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_worker_nonzero_exit_is_worker_crash() {
        let handshake: Arc<dyn HandshakeStore> = Arc::new(MemoryHandshakeStore::new());
        let pool = ProcessPool::new(
            handshake,
            ProcessPoolConfig {
                worker_program: PathBuf::from("/bin/false"),
                graceful_shutdown_seconds: 1,
                cancel_check_interval_ms: 20,
            },
        );

        let result = pool
            .execute(request(), 30, Arc::new(crate::exec::runner::NeverCancelled))
            .await
            .unwrap();
        assert_eq!(result.error_type.as_deref(), Some("WorkerCrash"));
        assert!(result
            .error_message
            .unwrap()
            .starts_with("Worker process exited with code"));
    }

    #[tokio::test]
    async fn test_cancel_sets_flag() {
        let handshake: Arc<dyn HandshakeStore> = Arc::new(MemoryHandshakeStore::new());
        let pool = ProcessPool::new(
            handshake.clone(),
            ProcessPoolConfig {
                worker_program: PathBuf::from("/bin/true"),
                graceful_shutdown_seconds: 1,
                cancel_check_interval_ms: 50,
            },
        );
        let id = Uuid::new_v4();
        pool.cancel(id).await.unwrap();
        assert!(handshake
            .exists(&handshake_keys::cancel(id))
            .await
            .unwrap());
    }
}
