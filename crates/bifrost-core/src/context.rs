//! Execution context handed to workflow handlers.

use bifrost_workflow::log::LogLevel;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capture::sanitize_value;
use crate::logger::ExecutionLogger;

/// Scope literal for executions not bound to an organization.
pub use bifrost_workflow::execution::GLOBAL_SCOPE;

/// User who triggered the execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub email: String,
    pub name: String,
}

/// Organization the execution runs on behalf of.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Organization {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Per-execution context: identity, scope, materialized config, extra
/// parameters, cooperative variable capture and integration-call tracking.
///
/// Extra (undeclared) parameters ride here and only here; they are never
/// injected into any global state shared between executions.
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub caller: Caller,
    pub organization: Option<Organization>,
    pub is_platform_admin: bool,
    config: BTreeMap<String, Value>,
    extra_params: BTreeMap<String, Value>,
    captured: Mutex<BTreeMap<String, Value>>,
    snapshots: Mutex<Vec<Value>>,
    integration_calls: Mutex<Vec<Value>>,
    logger: Mutex<Option<Arc<ExecutionLogger>>>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        execution_id: Uuid,
        caller: Caller,
        organization: Option<Organization>,
        config: BTreeMap<String, Value>,
        is_platform_admin: bool,
    ) -> Self {
        Self {
            execution_id,
            caller,
            organization,
            is_platform_admin,
            config,
            extra_params: BTreeMap::new(),
            captured: Mutex::new(BTreeMap::new()),
            snapshots: Mutex::new(Vec::new()),
            integration_calls: Mutex::new(Vec::new()),
            logger: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Organization id, or `None` for the global scope.
    pub fn org_id(&self) -> Option<&str> {
        self.organization.as_ref().map(|org| org.id.as_str())
    }

    /// Partition scope: the organization id, or the GLOBAL literal.
    pub fn scope(&self) -> &str {
        self.org_id().unwrap_or(GLOBAL_SCOPE)
    }

    pub fn is_global_scope(&self) -> bool {
        self.organization.is_none()
    }

    pub fn executed_by(&self) -> &str {
        &self.caller.user_id
    }

    pub fn executed_by_name(&self) -> &str {
        &self.caller.name
    }

    // -------------------------------------------------------------------------
    // Config
    // -------------------------------------------------------------------------

    pub fn get_config(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    pub fn has_config(&self, key: &str) -> bool {
        self.config.contains_key(key)
    }

    // -------------------------------------------------------------------------
    // Extra parameters
    // -------------------------------------------------------------------------

    pub(crate) fn set_extra_params(&mut self, extras: BTreeMap<String, Value>) {
        for (name, value) in &extras {
            self.captured
                .lock()
                .insert(name.clone(), sanitize_value(value));
        }
        self.extra_params = extras;
    }

    /// Parameters supplied by the caller but not declared in metadata.
    pub fn extra_params(&self) -> &BTreeMap<String, Value> {
        &self.extra_params
    }

    pub fn extra(&self, name: &str) -> Option<&Value> {
        self.extra_params.get(name)
    }

    // -------------------------------------------------------------------------
    // Variable capture (cooperative; automatic capture exists only for
    // scripts, where the VM exposes the frame)
    // -------------------------------------------------------------------------

    /// Record a named value into the execution's captured variables.
    /// Unserializable values degrade to their type name.
    pub fn capture<T: Serialize>(&self, name: impl Into<String>, value: &T) {
        let sanitized = match serde_json::to_value(value) {
            Ok(v) => sanitize_value(&v),
            Err(_) => Value::String(format!("<{}>", short_type_name::<T>())),
        };
        self.captured.lock().insert(name.into(), sanitized);
    }

    pub(crate) fn merge_captured(&self, variables: BTreeMap<String, Value>) {
        let mut captured = self.captured.lock();
        for (name, value) in variables {
            captured.insert(name, value);
        }
    }

    pub fn captured_variables(&self) -> BTreeMap<String, Value> {
        self.captured.lock().clone()
    }

    // -------------------------------------------------------------------------
    // Checkpoints
    // -------------------------------------------------------------------------

    /// Save a named state snapshot, persisted alongside the execution.
    pub fn save_checkpoint(&self, name: impl Into<String>, data: Value) {
        self.snapshots.lock().push(json!({
            "name": name.into(),
            "timestamp": chrono::Utc::now(),
            "data": sanitize_value(&data),
        }));
    }

    pub fn snapshots(&self) -> Vec<Value> {
        self.snapshots.lock().clone()
    }

    // -------------------------------------------------------------------------
    // Integration-call tracking
    // -------------------------------------------------------------------------

    /// Record an outbound integration call for auditability. The count is
    /// also how cache hits are observable: a cached provider result makes
    /// no calls.
    pub fn track_integration_call(&self, system: &str, operation: &str, details: Value) {
        self.integration_calls.lock().push(json!({
            "system": system,
            "operation": operation,
            "timestamp": chrono::Utc::now(),
            "details": sanitize_value(&details),
        }));
    }

    pub fn integration_calls(&self) -> Vec<Value> {
        self.integration_calls.lock().clone()
    }

    // -------------------------------------------------------------------------
    // Logging
    // -------------------------------------------------------------------------

    pub(crate) fn attach_logger(&self, logger: Arc<ExecutionLogger>) {
        *self.logger.lock() = Some(logger);
    }

    /// Emit a user-visible log line. The log-store write completes before
    /// this returns; only the broadcast is backgrounded.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        // Clone the handle out so the guard is not held across the await.
        let logger = self.logger.lock().clone();
        if let Some(logger) = logger {
            let source = logger.default_source();
            logger.emit(level, message.into(), source).await;
        }
    }

    pub async fn log_debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message).await;
    }

    pub async fn log_info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message).await;
    }

    pub async fn log_warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message).await;
    }

    pub async fn log_error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message).await;
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    pub(crate) fn bind_cancellation(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    /// Token handlers can select on to observe cooperative cancellation.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            Uuid::new_v4(),
            Caller {
                user_id: "user-1".into(),
                email: "one@example.com".into(),
                name: "User One".into(),
            },
            None,
            BTreeMap::new(),
            false,
        )
    }

    #[test]
    fn test_scope_defaults_to_global() {
        let ctx = context();
        assert_eq!(ctx.scope(), GLOBAL_SCOPE);
        assert!(ctx.is_global_scope());
    }

    #[test]
    fn test_extras_are_captured_but_not_config() {
        let mut ctx = context();
        ctx.set_extra_params(BTreeMap::from([("ticket".to_string(), json!("T-99"))]));
        assert_eq!(ctx.extra("ticket"), Some(&json!("T-99")));
        assert_eq!(ctx.captured_variables()["ticket"], json!("T-99"));
        assert!(!ctx.has_config("ticket"));
    }

    #[test]
    fn test_capture_degrades_unserializable_values() {
        struct Opaque;
        impl Serialize for Opaque {
            fn serialize<S: serde::Serializer>(&self, _s: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("nope"))
            }
        }
        let ctx = context();
        ctx.capture("handle", &Opaque);
        assert_eq!(ctx.captured_variables()["handle"], json!("<Opaque>"));
    }

    #[test]
    fn test_integration_calls_accumulate() {
        let ctx = context();
        ctx.track_integration_call("crm", "list_licenses", json!({"page": 1}));
        ctx.track_integration_call("crm", "list_licenses", json!({"page": 2}));
        assert_eq!(ctx.integration_calls().len(), 2);
    }
}
