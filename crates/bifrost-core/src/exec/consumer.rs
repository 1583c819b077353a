//! Queue consumer: drives one queued execution through its lifecycle.
//!
//! One message in flight at a time; no mutable state is shared across
//! executions. Delivery is at-least-once, so the consumer is idempotent at
//! terminal status: a redelivered message whose record already left
//! Pending short-circuits without re-running user code.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use bifrost_workflow::message::ExecutionMessage;
use bifrost_workflow::metadata::{DEFAULT_CACHE_TTL_SECONDS, DEFAULT_TIMEOUT_SECONDS};
use bifrost_workflow::status::ExecutionStatus;

use crate::context::{Caller, Organization};
use crate::discovery::WorkflowRegistry;
use crate::engine::ExecutionRequest;
use crate::error::EngineError;
use crate::exec::runner::{CancelProbe, ExecutionBackend};
use crate::repository::{ExecutionOutcome, ExecutionRecorder};
use crate::storage::WorkQueue;

/// Source of materialized per-scope configuration. Organization and config
/// storage are external collaborators; deployments inject a real source,
/// tests and single-tenant setups use [`EmptyConfigSource`].
#[async_trait]
pub trait ScopeConfigSource: Send + Sync {
    async fn organization(&self, org_id: &str) -> Option<Organization>;

    async fn config(&self, scope: &str) -> BTreeMap<String, Value>;
}

/// Config source for deployments without org/config storage.
pub struct EmptyConfigSource;

#[async_trait]
impl ScopeConfigSource for EmptyConfigSource {
    async fn organization(&self, org_id: &str) -> Option<Organization> {
        Some(Organization {
            id: org_id.to_string(),
            name: org_id.to_string(),
            is_active: true,
        })
    }

    async fn config(&self, _scope: &str) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }
}

/// Probe reporting whether the record has been flagged Cancelling.
struct StatusCancelProbe {
    recorder: ExecutionRecorder,
    execution_id: Uuid,
    scope: Option<String>,
}

#[async_trait]
impl CancelProbe for StatusCancelProbe {
    async fn is_cancel_requested(&self) -> bool {
        matches!(
            self.recorder
                .repository()
                .get_status(self.execution_id, self.scope.as_deref())
                .await,
            Ok(Some(ExecutionStatus::Cancelling))
        )
    }
}

/// The workflow-execution queue consumer.
pub struct QueueConsumer {
    queue: Arc<dyn WorkQueue>,
    recorder: ExecutionRecorder,
    registry: Arc<WorkflowRegistry>,
    backend: Arc<dyn ExecutionBackend>,
    config_source: Arc<dyn ScopeConfigSource>,
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        recorder: ExecutionRecorder,
        registry: Arc<WorkflowRegistry>,
        backend: Arc<dyn ExecutionBackend>,
        config_source: Arc<dyn ScopeConfigSource>,
    ) -> Self {
        Self {
            queue,
            recorder,
            registry,
            backend,
            config_source,
        }
    }

    /// Consume until the queue closes. Processing failures are logged and
    /// the message acknowledged anyway: deterministic failures must not
    /// trigger unbounded redelivery, and the record already carries the
    /// terminal state.
    pub async fn run(&self) -> Result<(), EngineError> {
        while let Some(delivery) = self.queue.receive().await? {
            if let Err(e) = self.process(delivery.message.clone()).await {
                error!(
                    execution_id = %delivery.message.execution_id,
                    error = %e,
                    "Failed to process execution message"
                );
            }
            self.queue.ack(&delivery).await?;
        }
        Ok(())
    }

    /// Drive one message through the status lifecycle.
    pub async fn process(&self, message: ExecutionMessage) -> Result<(), EngineError> {
        let execution_id = message.execution_id;
        let scope = message.org_id.clone();
        let started = chrono::Utc::now();

        info!(
            execution_id = %execution_id,
            workflow = %message.workflow_name,
            scope = scope.as_deref().unwrap_or("GLOBAL"),
            "Processing queued execution"
        );

        // Pre-check: cancelled before start, or a redelivered duplicate.
        let current = self
            .recorder
            .repository()
            .get_status(execution_id, scope.as_deref())
            .await?;
        match current {
            None => {
                warn!(execution_id = %execution_id, "No record for queued execution, dropping");
                return Ok(());
            }
            Some(ExecutionStatus::Cancelling) => {
                info!(execution_id = %execution_id, "Cancelled before start");
                let mut outcome = ExecutionOutcome::status(ExecutionStatus::Cancelled);
                outcome.error_message =
                    Some("Execution was cancelled before it could start".to_string());
                outcome.duration_ms = Some(0);
                self.recorder
                    .update(execution_id, scope.as_deref(), outcome)
                    .await?;
                return Ok(());
            }
            Some(ExecutionStatus::Pending) => {}
            Some(status) => {
                info!(
                    execution_id = %execution_id,
                    status = %status,
                    "Record already progressed, skipping redelivered message"
                );
                return Ok(());
            }
        }

        self.recorder
            .update(
                execution_id,
                scope.as_deref(),
                ExecutionOutcome::status(ExecutionStatus::Running),
            )
            .await?;

        // Rebuild scope context from external storage.
        let organization = match &scope {
            Some(org_id) => self.config_source.organization(org_id).await,
            None => None,
        };
        let config = self
            .config_source
            .config(scope.as_deref().unwrap_or("GLOBAL"))
            .await;

        // Named workflows resolve metadata for the timeout; scripts use the
        // default.
        let mut timeout_seconds = DEFAULT_TIMEOUT_SECONDS;
        let mut cache_ttl_seconds = DEFAULT_CACHE_TTL_SECONDS;
        if !message.is_script() {
            match self.registry.get_workflow(&message.workflow_name) {
                Some((metadata, _)) => {
                    timeout_seconds = metadata.timeout_seconds;
                    cache_ttl_seconds = metadata.cache_ttl_seconds;
                }
                None => {
                    let duration_ms = (chrono::Utc::now() - started).num_milliseconds();
                    let mut outcome = ExecutionOutcome::status(ExecutionStatus::Failed);
                    outcome.error_message =
                        Some(format!("Workflow '{}' not found", message.workflow_name));
                    outcome.error_type = Some("WorkflowNotFound".to_string());
                    outcome.duration_ms = Some(duration_ms);
                    self.recorder
                        .update(execution_id, scope.as_deref(), outcome)
                        .await?;
                    return Ok(());
                }
            }
        }

        let request = ExecutionRequest {
            execution_id,
            caller: Caller {
                user_id: message.user_id.clone(),
                email: message.user_email.clone(),
                name: message.user_name.clone(),
            },
            organization,
            config,
            name: if message.is_script() {
                None
            } else {
                Some(message.workflow_name.clone())
            },
            code: message.code.clone(),
            tags: if message.is_script() {
                Vec::new()
            } else {
                vec!["workflow".to_string()]
            },
            parameters: message.parameters.clone(),
            timeout_seconds,
            cache_ttl_seconds,
            transient: false,
            no_cache: false,
            is_platform_admin: false,
        };

        let probe = Arc::new(StatusCancelProbe {
            recorder: self.recorder.clone(),
            execution_id,
            scope: scope.clone(),
        });

        let outcome = match self
            .backend
            .execute(request, timeout_seconds, probe)
            .await
        {
            Ok(worker_result) => ExecutionOutcome::from_worker_result(worker_result),
            Err(EngineError::Cancelled) => {
                let mut outcome = ExecutionOutcome::status(ExecutionStatus::Cancelled);
                outcome.error_message = Some("Execution cancelled by user".to_string());
                outcome.duration_ms =
                    Some((chrono::Utc::now() - started).num_milliseconds());
                outcome
            }
            Err(EngineError::Timeout(seconds)) => {
                let mut outcome = ExecutionOutcome::status(ExecutionStatus::Timeout);
                outcome.error_message =
                    Some(format!("Execution exceeded timeout of {seconds} seconds"));
                outcome.error_type = Some("TimeoutError".to_string());
                outcome.duration_ms =
                    Some((chrono::Utc::now() - started).num_milliseconds());
                outcome
            }
            Err(e) => {
                let mut outcome = ExecutionOutcome::status(ExecutionStatus::Failed);
                outcome.error_message = Some(e.to_string());
                outcome.error_type =
                    Some(e.error_type().unwrap_or("InternalError").to_string());
                outcome.duration_ms =
                    Some((chrono::Utc::now() - started).num_milliseconds());
                outcome
            }
        };

        let status = outcome.status;
        self.recorder
            .update(execution_id, scope.as_deref(), outcome)
            .await?;

        info!(
            execution_id = %execution_id,
            workflow = %message.workflow_name,
            status = %status,
            "Queued execution complete"
        );
        Ok(())
    }
}
