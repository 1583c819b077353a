//! Dispatch layer: sync vs. async execution and API response shaping.
//!
//! Scripts always queue; named workflows queue only when their metadata
//! says `async`. The async path creates the record, flips it to Pending,
//! publishes the message and returns immediately. The sync path runs the
//! engine in-process with a live broadcaster and shapes the full response,
//! filtering error details and log levels for non-admin callers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use bifrost_workflow::error::GENERIC_ERROR_MESSAGE;
use bifrost_workflow::execution::WorkflowExecution;
use bifrost_workflow::log::LogEntry;
use bifrost_workflow::message::ExecutionMessage;
use bifrost_workflow::metadata::ExecutionMode;
use bifrost_workflow::status::ExecutionStatus;
use bifrost_workflow::WorkflowError;

use crate::context::{Caller, Organization};
use crate::engine::{Engine, ExecutionRequest, ExecutionResult, DATA_PROVIDER_TAG};
use crate::error::EngineError;
use crate::repository::{ExecutionOutcome, ExecutionRecorder};
use crate::storage::WorkQueue;

/// Identity and scope of the caller dispatching an execution.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub caller: Caller,
    pub organization: Option<Organization>,
    pub config: BTreeMap<String, Value>,
    pub is_platform_admin: bool,
}

impl DispatchContext {
    pub fn org_id(&self) -> Option<&str> {
        self.organization.as_ref().map(|org| org.id.as_str())
    }

    pub fn scope(&self) -> &str {
        self.org_id().unwrap_or("GLOBAL")
    }
}

/// API-shaped execution response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<LogEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub is_transient: bool,
}

/// The dispatcher.
pub struct Dispatcher {
    engine: Arc<Engine>,
    recorder: ExecutionRecorder,
    queue: Arc<dyn WorkQueue>,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>, recorder: ExecutionRecorder, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            engine,
            recorder,
            queue,
        }
    }

    /// Execute a named workflow. Unknown names fail before any record is
    /// written.
    pub async fn run_workflow(
        &self,
        dctx: &DispatchContext,
        workflow_name: &str,
        input_data: BTreeMap<String, Value>,
        form_id: Option<String>,
        transient: bool,
    ) -> Result<ExecutionResponse, EngineError> {
        let Some((metadata, _handler)) = self.engine.registry().get_workflow(workflow_name)
        else {
            return Err(WorkflowError::NotFound(workflow_name.to_string()).into());
        };

        if metadata.execution_mode == ExecutionMode::Async {
            return self
                .enqueue(dctx, workflow_name, input_data, form_id, None)
                .await;
        }

        self.execute_sync(
            dctx,
            workflow_name,
            metadata.timeout_seconds,
            metadata.cache_ttl_seconds,
            input_data,
            form_id,
            transient,
        )
        .await
    }

    /// Execute inline script source. Scripts always run async.
    pub async fn run_script(
        &self,
        dctx: &DispatchContext,
        source: &str,
        script_name: &str,
        input_data: BTreeMap<String, Value>,
    ) -> Result<ExecutionResponse, EngineError> {
        let code = BASE64.encode(source.as_bytes());
        self.enqueue(dctx, script_name, input_data, None, Some(code))
            .await
    }

    /// Execute a data provider and return its options. Providers run
    /// transient (no record) and must return a list.
    pub async fn run_data_provider(
        &self,
        dctx: &DispatchContext,
        provider_name: &str,
        parameters: BTreeMap<String, Value>,
        no_cache: bool,
    ) -> Result<Vec<Value>, EngineError> {
        let Some((metadata, _handler)) = self.engine.registry().get_data_provider(provider_name)
        else {
            return Err(WorkflowError::NotFound(provider_name.to_string()).into());
        };

        let request = ExecutionRequest {
            execution_id: Uuid::new_v4(),
            caller: dctx.caller.clone(),
            organization: dctx.organization.clone(),
            config: dctx.config.clone(),
            name: Some(provider_name.to_string()),
            code: None,
            tags: vec![DATA_PROVIDER_TAG.to_string()],
            parameters,
            timeout_seconds: metadata.timeout_seconds,
            cache_ttl_seconds: metadata.cache_ttl_seconds,
            transient: true,
            no_cache,
            is_platform_admin: dctx.is_platform_admin,
        };

        let result = self.engine.execute(request, CancellationToken::new()).await;
        if result.status != ExecutionStatus::Success {
            return Err(EngineError::Internal(format!(
                "Data provider execution failed: {}",
                result.error_message.unwrap_or_default()
            )));
        }
        match result.result {
            Some(Value::Array(options)) => Ok(options),
            Some(other) => Err(EngineError::Internal(format!(
                "Data provider must return a list, got {}",
                json_type_name(&other)
            ))),
            None => Err(EngineError::Internal(
                "Data provider must return a list, got null".to_string(),
            )),
        }
    }

    /// Async path: record at Running-intent, flip to Pending, enqueue,
    /// return 202-shaped response.
    async fn enqueue(
        &self,
        dctx: &DispatchContext,
        workflow_name: &str,
        parameters: BTreeMap<String, Value>,
        form_id: Option<String>,
        code: Option<String>,
    ) -> Result<ExecutionResponse, EngineError> {
        let execution_id = Uuid::new_v4();

        let execution = WorkflowExecution {
            execution_id,
            workflow_name: workflow_name.to_string(),
            org_id: dctx.org_id().map(String::from),
            form_id: form_id.clone(),
            executed_by: dctx.caller.user_id.clone(),
            executed_by_name: dctx.caller.name.clone(),
            status: ExecutionStatus::Running,
            input_data: parameters.clone(),
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
        self.recorder.create(&execution).await?;
        self.recorder
            .update(
                execution_id,
                dctx.org_id(),
                ExecutionOutcome::status(ExecutionStatus::Pending),
            )
            .await?;

        let message = ExecutionMessage {
            execution_id,
            workflow_name: workflow_name.to_string(),
            org_id: dctx.org_id().map(String::from),
            user_id: dctx.caller.user_id.clone(),
            user_name: dctx.caller.name.clone(),
            user_email: dctx.caller.email.clone(),
            parameters,
            form_id,
            code,
        };
        self.queue
            .publish(&message)
            .await
            .map_err(|e| EngineError::Queue(e.to_string()))?;

        info!(
            execution_id = %execution_id,
            workflow = workflow_name,
            scope = dctx.scope(),
            "Enqueued async execution"
        );

        Ok(ExecutionResponse {
            execution_id,
            workflow_name: workflow_name.to_string(),
            status: ExecutionStatus::Pending,
            result: None,
            error: None,
            error_type: None,
            duration_ms: None,
            started_at: None,
            completed_at: None,
            logs: None,
            variables: None,
            is_transient: false,
        })
    }

    /// Sync path: record at Running, run the engine in-process, commit the
    /// terminal outcome, shape the filtered response.
    #[allow(clippy::too_many_arguments)]
    async fn execute_sync(
        &self,
        dctx: &DispatchContext,
        workflow_name: &str,
        timeout_seconds: u64,
        cache_ttl_seconds: u64,
        parameters: BTreeMap<String, Value>,
        form_id: Option<String>,
        transient: bool,
    ) -> Result<ExecutionResponse, EngineError> {
        let execution_id = Uuid::new_v4();
        let started_at = Utc::now();

        if !transient {
            let execution = WorkflowExecution {
                execution_id,
                workflow_name: workflow_name.to_string(),
                org_id: dctx.org_id().map(String::from),
                form_id: form_id.clone(),
                executed_by: dctx.caller.user_id.clone(),
                executed_by_name: dctx.caller.name.clone(),
                status: ExecutionStatus::Running,
                input_data: parameters.clone(),
                result: None,
                result_type: None,
                result_in_blob: false,
                error_message: None,
                error_type: None,
                duration_ms: None,
                started_at,
                completed_at: None,
                metrics: None,
            };
            self.recorder.create(&execution).await?;
        }

        info!(
            execution_id = %execution_id,
            workflow = workflow_name,
            scope = dctx.scope(),
            "Starting sync execution"
        );

        let request = ExecutionRequest {
            execution_id,
            caller: dctx.caller.clone(),
            organization: dctx.organization.clone(),
            config: dctx.config.clone(),
            name: Some(workflow_name.to_string()),
            code: None,
            tags: vec!["workflow".to_string()],
            parameters,
            timeout_seconds,
            cache_ttl_seconds,
            transient,
            no_cache: false,
            is_platform_admin: dctx.is_platform_admin,
        };

        let result = self.engine.execute(request, CancellationToken::new()).await;

        if !transient {
            let mut outcome = ExecutionOutcome::status(result.status);
            outcome.result = result.result.clone();
            outcome.error_message = result.error_message.clone();
            outcome.error_type = result.error_type.clone();
            outcome.duration_ms = Some(result.duration_ms);
            outcome.logs = result.logs.clone();
            outcome.variables = Some(result.variables.clone().unwrap_or_default());
            outcome.snapshots = result.snapshots.clone();
            if let Err(e) = self
                .recorder
                .update(execution_id, dctx.org_id(), outcome)
                .await
            {
                error!(execution_id = %execution_id, error = %e, "Failed to commit sync execution record");
            }
        }

        Ok(shape_response(
            execution_id,
            workflow_name,
            started_at,
            result,
            dctx.is_platform_admin,
            transient,
        ))
    }
}

/// Visibility rules: admins see full error details, all levels and the
/// captured variables. Everyone else sees UserError messages verbatim, a
/// generic message for other failures, and logs without DEBUG/TRACEBACK.
fn shape_response(
    execution_id: Uuid,
    workflow_name: &str,
    started_at: DateTime<Utc>,
    result: ExecutionResult,
    is_platform_admin: bool,
    transient: bool,
) -> ExecutionResponse {
    let mut error = None;
    let mut error_type = None;
    if result.status != ExecutionStatus::Success {
        if let Some(message) = &result.error_message {
            if is_platform_admin {
                error = Some(message.clone());
                error_type = result.error_type.clone();
            } else if result.error_type.as_deref() == Some("UserError") {
                error = Some(message.clone());
            } else {
                error = Some(GENERIC_ERROR_MESSAGE.to_string());
            }
        }
    }

    let logs = if result.logs.is_empty() {
        None
    } else if is_platform_admin {
        Some(result.logs)
    } else {
        Some(
            result
                .logs
                .into_iter()
                .filter(|entry| !entry.level.is_admin_only())
                .collect(),
        )
    };

    ExecutionResponse {
        execution_id,
        workflow_name: workflow_name.to_string(),
        status: result.status,
        result: if result.status == ExecutionStatus::Success
            || result.status == ExecutionStatus::CompletedWithErrors
        {
            result.result
        } else {
            None
        },
        error,
        error_type,
        duration_ms: Some(result.duration_ms),
        started_at: Some(started_at),
        completed_at: Some(Utc::now()),
        logs,
        variables: if is_platform_admin {
            result.variables
        } else {
            None
        },
        is_transient: transient,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
