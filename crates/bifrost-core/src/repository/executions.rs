//! Execution record store and index manager.
//!
//! One primary row per execution plus derived index rows serving list
//! views without a join back to the primary record:
//!
//! 1. Primary: `execution:{reverse_ts}_{uuid}` (entities table, partition =
//!    scope)
//! 2. User index: `userexec:{user_id}:{execution_id}`
//! 3. Workflow index: `workflowexec:{workflow_name}:{scope}:{execution_id}`
//! 4. Form index: `formexec:{form_id}:{execution_id}` (only with a form)
//! 5. Status index: `status:{status}:{execution_id}` (only while
//!    Pending/Running)
//!
//! Index rows live in the relationships table under the literal GLOBAL
//! partition and carry denormalized display fields. Index writes are
//! best-effort: a failure after the primary write is logged, never rolled
//! back, and read paths fall back to the primary row. Only the primary row
//! is authoritative.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use bifrost_workflow::execution::{ResourceMetrics, ResultKind, WorkflowExecution, GLOBAL_SCOPE};
use bifrost_workflow::status::ExecutionStatus;

use crate::storage::{StorageError, TableEntity, TableStore};

/// Partition holding every index row.
const RELATIONSHIPS_PARTITION: &str = "GLOBAL";

/// Row-key prefix of primary rows.
const ENTITY_PREFIX: &str = "execution:";

/// Default stuck-execution thresholds.
pub const DEFAULT_PENDING_TIMEOUT_MINUTES: i64 = 10;
pub const DEFAULT_RUNNING_TIMEOUT_MINUTES: i64 = 30;

/// Reverse timestamp so primary range scans return newest first.
fn reverse_timestamp(at: DateTime<Utc>) -> String {
    (9_999_999_999_999 - at.timestamp_millis()).to_string()
}

fn entity_row_key(started_at: DateTime<Utc>, execution_id: Uuid) -> String {
    format!("{ENTITY_PREFIX}{}_{execution_id}", reverse_timestamp(started_at))
}

fn pointer_row_key(execution_id: Uuid) -> String {
    format!("execid:{execution_id}")
}

fn user_index_key(user_id: &str, execution_id: Uuid) -> String {
    format!("userexec:{user_id}:{execution_id}")
}

fn workflow_index_key(workflow_name: &str, scope: &str, execution_id: Uuid) -> String {
    format!("workflowexec:{workflow_name}:{scope}:{execution_id}")
}

fn form_index_key(form_id: &str, execution_id: Uuid) -> String {
    format!("formexec:{form_id}:{execution_id}")
}

fn status_index_key(status: ExecutionStatus, execution_id: Uuid) -> String {
    format!("status:{}:{execution_id}", status.as_str())
}

/// Pointer from an execution id to its primary row, maintained alongside
/// the indexes. The underlying table store is a pure key-range store with
/// no secondary filters, so id-based point reads need this hop.
#[derive(Debug, Serialize, Deserialize)]
struct PointerRow {
    partition_key: String,
    row_key: String,
}

/// Denormalized display projection stored on every index row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexRow {
    execution_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization_id: Option<String>,
    workflow_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    form_id: Option<String>,
    status: ExecutionStatus,
    started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    executed_by: String,
    executed_by_name: String,
    updated_at: DateTime<Utc>,
}

impl IndexRow {
    fn from_execution(execution: &WorkflowExecution) -> Self {
        Self {
            execution_id: execution.execution_id,
            organization_id: execution.org_id.clone(),
            workflow_name: execution.workflow_name.clone(),
            form_id: execution.form_id.clone(),
            status: execution.status,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            duration_ms: execution.duration_ms,
            error_message: execution.error_message.clone(),
            executed_by: execution.executed_by.clone(),
            executed_by_name: execution.executed_by_name.clone(),
            updated_at: Utc::now(),
        }
    }

    /// List views render straight off the index; large fields stay empty.
    fn into_projection(self) -> WorkflowExecution {
        WorkflowExecution {
            execution_id: self.execution_id,
            workflow_name: self.workflow_name,
            org_id: self.organization_id,
            form_id: self.form_id,
            executed_by: self.executed_by,
            executed_by_name: self.executed_by_name,
            status: self.status,
            input_data: BTreeMap::new(),
            result: None,
            result_type: None,
            result_in_blob: false,
            error_message: self.error_message,
            error_type: None,
            duration_ms: self.duration_ms,
            started_at: self.started_at,
            completed_at: self.completed_at,
            metrics: None,
        }
    }
}

/// Fields applied by [`ExecutionRepository::update`].
#[derive(Debug, Default, Clone)]
pub struct ExecutionPatch {
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub result_type: Option<ResultKind>,
    pub result_in_blob: bool,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub duration_ms: Option<i64>,
    pub metrics: Option<ResourceMetrics>,
}

impl ExecutionPatch {
    pub fn status(status: ExecutionStatus) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }
}

fn to_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Repository for execution records with automatic index maintenance.
#[derive(Clone)]
pub struct ExecutionRepository {
    entities: Arc<dyn TableStore>,
    relationships: Arc<dyn TableStore>,
}

impl ExecutionRepository {
    pub fn new(entities: Arc<dyn TableStore>, relationships: Arc<dyn TableStore>) -> Self {
        Self {
            entities,
            relationships,
        }
    }

    /// Create the primary record and all applicable index rows.
    ///
    /// Write order: primary -> pointer -> user -> workflow -> status ->
    /// form. Index failures after the primary write are logged and left
    /// for read paths to tolerate.
    pub async fn create(&self, execution: &WorkflowExecution) -> Result<(), StorageError> {
        let scope = execution.scope().to_string();
        let row_key = entity_row_key(execution.started_at, execution.execution_id);

        self.entities
            .insert(TableEntity::new(
                scope.clone(),
                row_key.clone(),
                to_object(serde_json::to_value(execution)?),
            ))
            .await?;

        let pointer = PointerRow {
            partition_key: scope.clone(),
            row_key,
        };
        self.relationships
            .upsert(TableEntity::new(
                RELATIONSHIPS_PARTITION,
                pointer_row_key(execution.execution_id),
                to_object(serde_json::to_value(&pointer)?),
            ))
            .await?;

        let index = IndexRow::from_execution(execution);
        let index_value = serde_json::to_value(&index)?;

        self.write_index(
            user_index_key(&execution.executed_by, execution.execution_id),
            &index_value,
        )
        .await;
        self.write_index(
            workflow_index_key(&execution.workflow_name, &scope, execution.execution_id),
            &index_value,
        )
        .await;
        if execution.status.is_active() {
            self.write_index(
                status_index_key(execution.status, execution.execution_id),
                &index_value,
            )
            .await;
        }
        if let Some(form_id) = &execution.form_id {
            self.write_index(form_index_key(form_id, execution.execution_id), &index_value)
                .await;
        }

        info!(
            execution_id = %execution.execution_id,
            workflow = %execution.workflow_name,
            scope = %scope,
            "Created execution with indexes"
        );
        Ok(())
    }

    async fn write_index(&self, row_key: String, value: &Value) {
        let entity = TableEntity::new(RELATIONSHIPS_PARTITION, row_key.clone(), to_object(value.clone()));
        if let Err(e) = self.relationships.upsert(entity).await {
            warn!(row_key = %row_key, error = %e, "Failed to write index row");
        }
    }

    /// Apply a patch to the primary record, refresh display fields on every
    /// index, and maintain the status index.
    ///
    /// Terminal statuses are immutable: a patch against an already-terminal
    /// record is ignored and the stored record returned. Concurrency
    /// conflicts on the primary write surface as
    /// [`StorageError::Concurrency`] and are not retried here.
    pub async fn update(
        &self,
        execution_id: Uuid,
        scope: Option<&str>,
        patch: ExecutionPatch,
    ) -> Result<WorkflowExecution, StorageError> {
        let entity = self
            .find_entity(execution_id, scope)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                partition: scope.unwrap_or(GLOBAL_SCOPE).to_string(),
                row: execution_id.to_string(),
            })?;

        let mut execution: WorkflowExecution =
            serde_json::from_value(Value::Object(entity.data.clone()))?;
        let old_status = execution.status;

        if old_status.is_terminal() && patch.status != old_status {
            warn!(
                execution_id = %execution_id,
                old_status = %old_status,
                requested = %patch.status,
                "Ignoring status change on terminal execution"
            );
            return Ok(execution);
        }

        execution.status = patch.status;
        if patch.status.is_terminal() {
            execution.completed_at = Some(Utc::now());
            execution.duration_ms = patch.duration_ms;
        }
        execution.error_message = patch.error_message;
        execution.error_type = patch.error_type;
        execution.result_in_blob = patch.result_in_blob;
        if patch.result_in_blob {
            execution.result = None;
            execution.result_type = patch.result_type;
        } else if patch.result.is_some() {
            execution.result = patch.result;
            execution.result_type = patch.result_type;
        }
        if patch.metrics.is_some() {
            execution.metrics = patch.metrics;
        }

        let mut updated = entity;
        updated.data = to_object(serde_json::to_value(&execution)?);
        self.entities.update(updated).await?;

        self.refresh_indexes(&execution, old_status).await;

        info!(
            execution_id = %execution_id,
            status = %execution.status,
            duration_ms = ?execution.duration_ms,
            "Updated execution"
        );
        Ok(execution)
    }

    async fn refresh_indexes(&self, execution: &WorkflowExecution, old_status: ExecutionStatus) {
        let scope = execution.scope().to_string();
        let index = IndexRow::from_execution(execution);
        let index_value = match serde_json::to_value(&index) {
            Ok(v) => v,
            Err(e) => {
                warn!(execution_id = %execution.execution_id, error = %e, "Failed to serialize index row");
                return;
            }
        };

        self.write_index(
            user_index_key(&execution.executed_by, execution.execution_id),
            &index_value,
        )
        .await;
        self.write_index(
            workflow_index_key(&execution.workflow_name, &scope, execution.execution_id),
            &index_value,
        )
        .await;
        if let Some(form_id) = &execution.form_id {
            self.write_index(form_index_key(form_id, execution.execution_id), &index_value)
                .await;
        }

        // Status index: drop the old active row first, then add the new one
        // only while the execution stays Pending/Running.
        if old_status.is_active() && old_status != execution.status {
            if let Err(e) = self
                .relationships
                .delete(
                    RELATIONSHIPS_PARTITION,
                    &status_index_key(old_status, execution.execution_id),
                )
                .await
            {
                warn!(execution_id = %execution.execution_id, error = %e, "Failed to delete status index row");
            }
        }
        if execution.status.is_active() && execution.status != old_status {
            self.write_index(
                status_index_key(execution.status, execution.execution_id),
                &index_value,
            )
            .await;
        }
    }

    /// Full record by id. `scope` restricts the read to one partition;
    /// platform-admin callers pass `None`.
    pub async fn get(
        &self,
        execution_id: Uuid,
        scope: Option<&str>,
    ) -> Result<Option<WorkflowExecution>, StorageError> {
        match self.find_entity(execution_id, scope).await? {
            Some(entity) => Ok(Some(serde_json::from_value(Value::Object(entity.data))?)),
            None => Ok(None),
        }
    }

    /// Authoritative status read (always from the primary row, never an
    /// index).
    pub async fn get_status(
        &self,
        execution_id: Uuid,
        scope: Option<&str>,
    ) -> Result<Option<ExecutionStatus>, StorageError> {
        Ok(self.get(execution_id, scope).await?.map(|e| e.status))
    }

    async fn find_entity(
        &self,
        execution_id: Uuid,
        scope: Option<&str>,
    ) -> Result<Option<TableEntity>, StorageError> {
        if let Some(pointer_entity) = self
            .relationships
            .get(RELATIONSHIPS_PARTITION, &pointer_row_key(execution_id))
            .await?
        {
            let pointer: PointerRow =
                serde_json::from_value(Value::Object(pointer_entity.data))?;
            if let Some(scope) = scope {
                if pointer.partition_key != scope {
                    return Ok(None);
                }
            }
            return self.entities.get(&pointer.partition_key, &pointer.row_key).await;
        }

        // Pointer row missing (partial create): fall back to scanning the
        // partition's primary rows.
        let partition = scope.unwrap_or(GLOBAL_SCOPE);
        let needle = execution_id.to_string();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .entities
                .query_prefix(partition, ENTITY_PREFIX, 100, continuation.as_deref())
                .await?;
            for entity in page.entities {
                if entity.row_key.ends_with(&needle) {
                    return Ok(Some(entity));
                }
            }
            match page.continuation {
                Some(token) => continuation = Some(token),
                None => return Ok(None),
            }
        }
    }

    // -------------------------------------------------------------------------
    // List paths: read the relevant index prefix and return display
    // projections directly, honoring the store's continuation token.
    // -------------------------------------------------------------------------

    pub async fn list_by_user(
        &self,
        user_id: &str,
        limit: usize,
        continuation: Option<&str>,
    ) -> Result<(Vec<WorkflowExecution>, Option<String>), StorageError> {
        self.list_index(&format!("userexec:{user_id}:"), limit, continuation)
            .await
    }

    pub async fn list_by_workflow(
        &self,
        workflow_name: &str,
        scope: &str,
        limit: usize,
        continuation: Option<&str>,
    ) -> Result<(Vec<WorkflowExecution>, Option<String>), StorageError> {
        self.list_index(
            &format!("workflowexec:{workflow_name}:{scope}:"),
            limit,
            continuation,
        )
        .await
    }

    pub async fn list_by_form(
        &self,
        form_id: &str,
        limit: usize,
        continuation: Option<&str>,
    ) -> Result<(Vec<WorkflowExecution>, Option<String>), StorageError> {
        self.list_index(&format!("formexec:{form_id}:"), limit, continuation)
            .await
    }

    async fn list_index(
        &self,
        prefix: &str,
        limit: usize,
        continuation: Option<&str>,
    ) -> Result<(Vec<WorkflowExecution>, Option<String>), StorageError> {
        let page = self
            .relationships
            .query_prefix(RELATIONSHIPS_PARTITION, prefix, limit, continuation)
            .await?;
        let executions = page
            .entities
            .into_iter()
            .filter_map(|entity| {
                serde_json::from_value::<IndexRow>(Value::Object(entity.data))
                    .ok()
                    .map(IndexRow::into_projection)
            })
            .collect();
        Ok((executions, page.continuation))
    }

    /// Full records for a scope, newest first (reverse-timestamp keys).
    pub async fn list_by_scope(
        &self,
        scope: &str,
        limit: usize,
        continuation: Option<&str>,
    ) -> Result<(Vec<WorkflowExecution>, Option<String>), StorageError> {
        let page = self
            .entities
            .query_prefix(scope, ENTITY_PREFIX, limit, continuation)
            .await?;
        let executions = page
            .entities
            .into_iter()
            .filter_map(|entity| serde_json::from_value(Value::Object(entity.data)).ok())
            .collect();
        Ok((executions, page.continuation))
    }

    /// Executions stuck in Pending or Running, judged by `started_at` age
    /// against the per-status timeout. Scans only the two status-index
    /// prefixes, never the primary table.
    pub async fn get_stuck(
        &self,
        pending_timeout_minutes: i64,
        running_timeout_minutes: i64,
    ) -> Result<Vec<WorkflowExecution>, StorageError> {
        let now = Utc::now();
        let mut stuck = Vec::new();

        for (status, timeout_minutes) in [
            (ExecutionStatus::Pending, pending_timeout_minutes),
            (ExecutionStatus::Running, running_timeout_minutes),
        ] {
            let prefix = format!("status:{}:", status.as_str());
            let page = self
                .relationships
                .query_prefix(RELATIONSHIPS_PARTITION, &prefix, 1000, None)
                .await?;
            for entity in page.entities {
                let Ok(row) = serde_json::from_value::<IndexRow>(Value::Object(entity.data))
                else {
                    continue;
                };
                if now - row.started_at > Duration::minutes(timeout_minutes) {
                    stuck.push(row.into_projection());
                }
            }
        }

        info!(count = stuck.len(), "Stuck execution sweep complete");
        Ok(stuck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryTableStore;
    use serde_json::json;

    fn repository() -> ExecutionRepository {
        ExecutionRepository::new(
            Arc::new(MemoryTableStore::new()),
            Arc::new(MemoryTableStore::new()),
        )
    }

    fn execution(org_id: Option<&str>, form_id: Option<&str>) -> WorkflowExecution {
        WorkflowExecution {
            execution_id: Uuid::new_v4(),
            workflow_name: "sum_two".into(),
            org_id: org_id.map(String::from),
            form_id: form_id.map(String::from),
            executed_by: "user-1".into(),
            executed_by_name: "User One".into(),
            status: ExecutionStatus::Pending,
            input_data: BTreeMap::from([("x".to_string(), json!(10))]),
            result: None,
            result_type: None,
            result_in_blob: false,
            error_message: None,
            error_type: None,
            duration_ms: None,
            started_at: Utc::now(),
            completed_at: None,
            metrics: None,
        }
    }

    #[tokio::test]
    async fn test_create_then_get_roundtrip() {
        let repo = repository();
        let exec = execution(Some("org-1"), None);
        repo.create(&exec).await.unwrap();

        let fetched = repo
            .get(exec.execution_id, Some("org-1"))
            .await
            .unwrap()
            .expect("expected record");
        assert_eq!(fetched.status, ExecutionStatus::Pending);
        assert_eq!(fetched.input_data["x"], json!(10));

        // Scope isolation: the wrong partition sees nothing.
        assert!(repo
            .get(exec.execution_id, Some("org-2"))
            .await
            .unwrap()
            .is_none());
        // Platform admins read across scopes.
        assert!(repo.get(exec.execution_id, None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_indexes_exist_after_create() {
        let repo = repository();
        let exec = execution(None, Some("form-9"));
        repo.create(&exec).await.unwrap();

        let (by_user, _) = repo.list_by_user("user-1", 10, None).await.unwrap();
        assert_eq!(by_user.len(), 1);
        assert_eq!(by_user[0].execution_id, exec.execution_id);

        let (by_workflow, _) = repo
            .list_by_workflow("sum_two", GLOBAL_SCOPE, 10, None)
            .await
            .unwrap();
        assert_eq!(by_workflow.len(), 1);

        let (by_form, _) = repo.list_by_form("form-9", 10, None).await.unwrap();
        assert_eq!(by_form.len(), 1);
    }

    #[tokio::test]
    async fn test_status_index_follows_lifecycle() {
        let repo = repository();
        let exec = execution(None, None);
        repo.create(&exec).await.unwrap();

        // Pending -> Running keeps an active-status row, under the new key.
        repo.update(
            exec.execution_id,
            None,
            ExecutionPatch::status(ExecutionStatus::Running),
        )
        .await
        .unwrap();
        let stuck = repo.get_stuck(-1, -1).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].status, ExecutionStatus::Running);

        // Terminal transition removes the status row entirely.
        repo.update(
            exec.execution_id,
            None,
            ExecutionPatch {
                status: ExecutionStatus::Success,
                result: Some(json!({"sum": 42})),
                result_type: Some(ResultKind::Json),
                duration_ms: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(repo.get_stuck(-1, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_status_is_immutable() {
        let repo = repository();
        let exec = execution(None, None);
        repo.create(&exec).await.unwrap();

        repo.update(
            exec.execution_id,
            None,
            ExecutionPatch {
                status: ExecutionStatus::Cancelled,
                error_message: Some("Execution cancelled by user".into()),
                duration_ms: Some(100),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let after = repo
            .update(
                exec.execution_id,
                None,
                ExecutionPatch::status(ExecutionStatus::Running),
            )
            .await
            .unwrap();
        assert_eq!(after.status, ExecutionStatus::Cancelled);
        assert!(after.completed_at.is_some());
        assert_eq!(after.duration_ms, Some(100));
    }

    #[tokio::test]
    async fn test_update_refreshes_index_display_fields() {
        let repo = repository();
        let exec = execution(None, None);
        repo.create(&exec).await.unwrap();

        repo.update(
            exec.execution_id,
            None,
            ExecutionPatch {
                status: ExecutionStatus::Failed,
                error_message: Some("boom".into()),
                error_type: Some("InternalError".into()),
                duration_ms: Some(12),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let (by_user, _) = repo.list_by_user("user-1", 10, None).await.unwrap();
        assert_eq!(by_user[0].status, ExecutionStatus::Failed);
        assert_eq!(by_user[0].error_message.as_deref(), Some("boom"));
        assert_eq!(by_user[0].duration_ms, Some(12));
        assert!(by_user[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_list_by_scope_orders_newest_first() {
        let repo = repository();
        let mut older = execution(None, None);
        older.started_at = Utc::now() - Duration::seconds(60);
        let newer = execution(None, None);
        repo.create(&older).await.unwrap();
        repo.create(&newer).await.unwrap();

        let (listed, _) = repo.list_by_scope(GLOBAL_SCOPE, 10, None).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].execution_id, newer.execution_id);
        assert_eq!(listed[1].execution_id, older.execution_id);
    }

    #[tokio::test]
    async fn test_list_by_user_pages_with_continuation() {
        let repo = repository();
        for _ in 0..5 {
            repo.create(&execution(None, None)).await.unwrap();
        }

        let (first, token) = repo.list_by_user("user-1", 2, None).await.unwrap();
        assert_eq!(first.len(), 2);
        let token = token.expect("expected continuation");

        let (rest, final_token) = repo
            .list_by_user("user-1", 10, Some(&token))
            .await
            .unwrap();
        assert_eq!(rest.len(), 3);
        assert!(final_token.is_none());

        // Pages never overlap.
        let first_ids: Vec<_> = first.iter().map(|e| e.execution_id).collect();
        assert!(rest.iter().all(|e| !first_ids.contains(&e.execution_id)));
    }

    #[tokio::test]
    async fn test_get_status_reads_primary_row() {
        let repo = repository();
        let exec = execution(Some("org-1"), None);
        repo.create(&exec).await.unwrap();
        assert_eq!(
            repo.get_status(exec.execution_id, Some("org-1"))
                .await
                .unwrap(),
            Some(ExecutionStatus::Pending)
        );
        assert_eq!(
            repo.get_status(Uuid::new_v4(), Some("org-1")).await.unwrap(),
            None
        );
    }
}
