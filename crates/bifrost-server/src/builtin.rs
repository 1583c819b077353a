//! Built-in workflows and data providers.
//!
//! Registered on every node: a connectivity check and a provider listing
//! the registered workflows for UI pickers.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use bifrost_core::{handler_fn, WorkflowRegistry};
use bifrost_workflow::metadata::{ParameterDef, ParameterType, WorkflowMetadata};

pub fn register_builtin(registry: &Arc<WorkflowRegistry>) -> Result<()> {
    registry.register_workflow(
        WorkflowMetadata::new("ping", "Connectivity check, echoes its message back")
            .with_timeout(30)
            .with_parameter(ParameterDef::new("message", ParameterType::String)),
        handler_fn(|ctx, params| async move {
            let message = params
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("pong")
                .to_string();
            ctx.log_info(format!("ping from {}", ctx.executed_by_name()))
                .await;
            Ok(json!({"message": message, "scope": ctx.scope()}))
        }),
    )?;

    let provider_registry = registry.clone();
    registry.register_data_provider(
        WorkflowMetadata::new("get_workflows", "Lists registered workflow names"),
        handler_fn(move |_ctx, _params| {
            let provider_registry = provider_registry.clone();
            async move {
                let options: Vec<_> = provider_registry
                    .workflow_names()
                    .into_iter()
                    .map(|name| json!({"label": name.clone(), "value": name}))
                    .collect();
                Ok(json!(options))
            }
        }),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bifrost_core::{Caller, DispatchContext, Dispatcher, Engine};
    use bifrost_core::broadcast::NoopBroadcaster;
    use bifrost_core::repository::{ExecutionRecorder, ExecutionRepository};
    use bifrost_core::storage::{MemoryBlobStore, MemoryTableStore, MemoryWorkQueue};
    use std::collections::BTreeMap;

    fn dispatcher() -> Dispatcher {
        let registry = Arc::new(WorkflowRegistry::new());
        register_builtin(&registry).unwrap();
        let engine = Arc::new(Engine::new(registry));
        let recorder = ExecutionRecorder::new(
            ExecutionRepository::new(
                Arc::new(MemoryTableStore::new()),
                Arc::new(MemoryTableStore::new()),
            ),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(NoopBroadcaster),
        );
        Dispatcher::new(engine, recorder, Arc::new(MemoryWorkQueue::new()))
    }

    fn dctx() -> DispatchContext {
        DispatchContext {
            caller: Caller {
                user_id: "user-1".into(),
                email: "one@example.com".into(),
                name: "User One".into(),
            },
            organization: None,
            config: BTreeMap::new(),
            is_platform_admin: false,
        }
    }

    #[tokio::test]
    async fn test_ping_echoes_message() {
        let response = dispatcher()
            .run_workflow(
                &dctx(),
                "ping",
                BTreeMap::from([("message".to_string(), json!("hello"))]),
                None,
                true,
            )
            .await
            .unwrap();
        assert_eq!(response.result.unwrap()["message"], json!("hello"));
    }

    #[tokio::test]
    async fn test_get_workflows_lists_registrations() {
        let options = dispatcher()
            .run_data_provider(&dctx(), "get_workflows", BTreeMap::new(), true)
            .await
            .unwrap();
        assert!(options
            .iter()
            .any(|option| option["value"] == json!("ping")));
    }
}
