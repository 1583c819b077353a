//! Unified execution engine.
//!
//! Single entry point for running named workflows, data providers and
//! inline scripts. The engine resolves the target, coerces parameters,
//! wires the per-execution log pipeline and variable capture, classifies
//! the outcome, and handles data-provider caching. It never enforces
//! timeouts or observes external cancellation itself; the process pool and
//! the in-process runner own those.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use bifrost_workflow::execution::{ResourceMetrics, WorkerResult, GLOBAL_SCOPE};
use bifrost_workflow::log::{LogEntry, LogLevel, LogSource};
use bifrost_workflow::metadata::{DEFAULT_CACHE_TTL_SECONDS, DEFAULT_TIMEOUT_SECONDS};
use bifrost_workflow::status::ExecutionStatus;
use bifrost_workflow::WorkflowError;

use crate::broadcast::{Broadcaster, NoopBroadcaster};
use crate::cache::ProviderCache;
use crate::coerce::{coerce_parameters, split_parameters};
use crate::context::{Caller, ExecutionContext, Organization};
use crate::discovery::WorkflowRegistry;
use crate::logger::ExecutionLogger;
use crate::repository::ExecutionLogRepository;
use crate::script;

/// Tag marking data-provider executions.
pub const DATA_PROVIDER_TAG: &str = "data_provider";

/// Request to execute a named function or an inline script. Also the exact
/// payload written to the worker handshake context key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub execution_id: Uuid,
    pub caller: Caller,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<Organization>,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,

    /// Registered function name. Mutually exclusive with `code`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Base64 inline script source. Mutually exclusive with `name`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,

    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,

    #[serde(default)]
    pub transient: bool,
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default)]
    pub is_platform_admin: bool,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL_SECONDS
}

impl ExecutionRequest {
    pub fn is_script(&self) -> bool {
        self.code.is_some()
    }

    pub fn is_data_provider(&self) -> bool {
        self.tags.iter().any(|t| t == DATA_PROVIDER_TAG)
    }

    pub fn scope(&self) -> &str {
        self.organization
            .as_ref()
            .map(|org| org.id.as_str())
            .unwrap_or(GLOBAL_SCOPE)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("script")
    }
}

/// Outcome of one engine run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub duration_ms: i64,
    pub logs: Vec<LogEntry>,
    pub variables: Option<BTreeMap<String, Value>>,
    pub integration_calls: Vec<Value>,
    pub snapshots: Vec<Value>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub cached: bool,
    pub cache_expires_at: Option<String>,
}

impl ExecutionResult {
    /// Shape this result into the handshake payload, attaching resource
    /// metrics measured by the caller.
    pub fn into_worker_result(self, metrics: Option<ResourceMetrics>) -> WorkerResult {
        WorkerResult {
            status: self.status,
            result: self.result,
            duration_ms: self.duration_ms,
            logs: self.logs,
            variables: self.variables,
            integration_calls: self.integration_calls,
            error_message: self.error_message,
            error_type: self.error_type,
            cached: self.cached,
            cache_expires_at: self.cache_expires_at,
            metrics,
            traceback: None,
        }
    }
}

/// The engine. Cheap to clone via `Arc`; one per process.
pub struct Engine {
    registry: Arc<WorkflowRegistry>,
    cache: Arc<ProviderCache>,
    logs: Option<ExecutionLogRepository>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl Engine {
    pub fn new(registry: Arc<WorkflowRegistry>) -> Self {
        Self {
            registry,
            cache: Arc::new(ProviderCache::new()),
            logs: None,
            broadcaster: Arc::new(NoopBroadcaster),
        }
    }

    /// Persist per-record logs through this repository (skipped for
    /// transient executions).
    pub fn with_log_repository(mut self, logs: ExecutionLogRepository) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ProviderCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ProviderCache> {
        &self.cache
    }

    /// Run one execution to completion. Always returns a result; user-code
    /// failures are classified and serialized, never propagated.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let started = Utc::now();
        let execution_id = request.execution_id;

        if request.code.is_some() == request.name.is_some() {
            return self.internal_failure(
                execution_id,
                started,
                "Must provide exactly one of code or name",
            );
        }

        // Cache short-circuit for data providers.
        if request.is_data_provider() && !request.no_cache {
            let key = ProviderCache::cache_key(
                request.scope(),
                request.display_name(),
                &request.parameters,
            );
            if let Some(hit) = self.cache.get(&key) {
                let duration_ms = (Utc::now() - started).num_milliseconds();
                return ExecutionResult {
                    execution_id,
                    status: ExecutionStatus::Success,
                    result: Some(hit.data),
                    duration_ms,
                    logs: Vec::new(),
                    variables: None,
                    integration_calls: Vec::new(),
                    snapshots: Vec::new(),
                    error_message: None,
                    error_type: None,
                    cached: true,
                    cache_expires_at: Some(
                        hit.expires_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                    ),
                };
            }
        }

        let source = if request.is_script() {
            LogSource::Script
        } else {
            LogSource::Workflow
        };
        let logger = ExecutionLogger::new(
            execution_id,
            source,
            if request.transient {
                None
            } else {
                self.logs.clone()
            },
            self.broadcaster.clone(),
        );

        let mut ctx = ExecutionContext::new(
            execution_id,
            request.caller.clone(),
            request.organization.clone(),
            request.config.clone(),
            request.is_platform_admin,
        );
        ctx.bind_cancellation(cancel);

        let run = self
            .run_user_code(&request, ctx, logger.clone())
            .await;

        let logs = logger.finish().await;
        let duration_ms = (Utc::now() - started).num_milliseconds();

        match run {
            Ok((value, ctx)) => {
                // A mapping carrying an explicit `success: false` completed,
                // but with errors.
                let status = match value.get("success") {
                    Some(Value::Bool(false)) => ExecutionStatus::CompletedWithErrors,
                    _ => ExecutionStatus::Success,
                };

                let mut cache_expires_at = None;
                if request.is_data_provider() && status == ExecutionStatus::Success {
                    let key = ProviderCache::cache_key(
                        request.scope(),
                        request.display_name(),
                        &request.parameters,
                    );
                    let expires =
                        self.cache
                            .put(&key, value.clone(), request.cache_ttl_seconds);
                    cache_expires_at =
                        Some(expires.to_rfc3339_opts(SecondsFormat::Millis, true));
                }

                debug!(
                    execution_id = %execution_id,
                    status = %status,
                    duration_ms,
                    "Execution finished"
                );

                ExecutionResult {
                    execution_id,
                    status,
                    result: Some(value),
                    duration_ms,
                    logs,
                    variables: Some(ctx.captured_variables()),
                    integration_calls: ctx.integration_calls(),
                    snapshots: ctx.snapshots(),
                    error_message: None,
                    error_type: None,
                    cached: false,
                    cache_expires_at,
                }
            }
            Err((e, ctx)) => {
                error!(
                    execution_id = %execution_id,
                    error = %e,
                    error_type = e.error_type(),
                    "Execution failed"
                );
                ExecutionResult {
                    execution_id,
                    status: ExecutionStatus::Failed,
                    result: None,
                    duration_ms,
                    logs,
                    variables: ctx.as_ref().map(|c| c.captured_variables()),
                    integration_calls: ctx
                        .as_ref()
                        .map(|c| c.integration_calls())
                        .unwrap_or_default(),
                    snapshots: ctx.as_ref().map(|c| c.snapshots()).unwrap_or_default(),
                    error_message: Some(e.to_string()),
                    error_type: Some(e.error_type().to_string()),
                    cached: false,
                    cache_expires_at: None,
                }
            }
        }
    }

    #[allow(clippy::type_complexity)]
    async fn run_user_code(
        &self,
        request: &ExecutionRequest,
        ctx: ExecutionContext,
        logger: Arc<ExecutionLogger>,
    ) -> Result<(Value, Arc<ExecutionContext>), (WorkflowError, Option<Arc<ExecutionContext>>)>
    {
        if let Some(code) = &request.code {
            let source = match script::decode_source(code) {
                Ok(source) => source,
                Err(e) => return Err((e, None)),
            };
            let ctx = Arc::new(ctx);
            ctx.attach_logger(logger.clone());

            let (outcome, variables) = script::execute_script(
                request.display_name(),
                &source,
                ctx.clone(),
                request.parameters.clone(),
            )
            .await;
            ctx.merge_captured(variables);
            return match outcome {
                Ok(value) => Ok((value, ctx)),
                Err(e) => {
                    self.log_failure(&logger, &e).await;
                    Err((e, Some(ctx)))
                }
            };
        }

        let name = request.name.as_deref().unwrap_or_default();
        let lookup = if request.is_data_provider() {
            self.registry.get_data_provider(name)
        } else {
            self.registry.get_workflow(name)
        };
        let Some((metadata, handler)) = lookup else {
            return Err((WorkflowError::NotFound(name.to_string()), None));
        };

        // Coerce declared types, then split declared vs extra parameters.
        let (coerced, warnings) =
            coerce_parameters(&metadata.parameters, request.parameters.clone());
        for warning in warnings {
            logger
                .emit(LogLevel::Warning, warning, logger.default_source())
                .await;
        }
        let (declared, extra) = split_parameters(&metadata.parameters, coerced);

        let mut ctx = ctx;
        ctx.set_extra_params(extra);
        let ctx = Arc::new(ctx);
        ctx.attach_logger(logger.clone());

        match handler.run(ctx.clone(), declared).await {
            Ok(value) => Ok((value, ctx)),
            Err(e) => {
                self.log_failure(&logger, &e).await;
                Err((e, Some(ctx)))
            }
        }
    }

    /// User-visible errors surface verbatim; anything else gets a generic
    /// line plus the full chain at the admin-only traceback level.
    async fn log_failure(&self, logger: &ExecutionLogger, e: &WorkflowError) {
        if e.is_user_visible() {
            logger.error(e.to_string()).await;
            return;
        }
        logger.error(bifrost_workflow::error::GENERIC_ERROR_MESSAGE).await;
        logger.traceback(format!("Error: {e}")).await;
        let mut messages = Vec::new();
        let mut source = std::error::Error::source(e);
        while let Some(inner) = source {
            messages.push(format!("Caused by: {inner}"));
            source = inner.source();
        }
        for message in messages {
            logger.traceback(message).await;
        }
    }

    fn internal_failure(
        &self,
        execution_id: Uuid,
        started: chrono::DateTime<Utc>,
        message: &str,
    ) -> ExecutionResult {
        ExecutionResult {
            execution_id,
            status: ExecutionStatus::Failed,
            result: None,
            duration_ms: (Utc::now() - started).num_milliseconds(),
            logs: Vec::new(),
            variables: None,
            integration_calls: Vec::new(),
            snapshots: Vec::new(),
            error_message: Some(message.to_string()),
            error_type: Some("InternalError".to_string()),
            cached: false,
            cache_expires_at: None,
        }
    }
}
