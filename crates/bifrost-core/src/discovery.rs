//! Workflow discovery, registration and validation.
//!
//! Native workflows are compiled in and registered with metadata; workspace
//! scripts live as `.rhai` files whose leading `//@ key: value` header
//! declares their metadata. The scanner reads the tree fresh on every scan,
//! so editor saves are picked up without a stale cache.

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use bifrost_workflow::metadata::{
    ExecutionMode, ParameterDef, ParameterType, ValidationIssue, ValidationReport,
    WorkflowMetadata, MAX_TIMEOUT_SECONDS, MIN_TIMEOUT_SECONDS,
};
use bifrost_workflow::WorkflowError;

use crate::context::ExecutionContext;
use crate::script;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[a-z0-9_]+$").expect("valid regex"))
}

/// A runnable workflow or data provider.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn run(
        &self,
        ctx: Arc<ExecutionContext>,
        parameters: BTreeMap<String, Value>,
    ) -> Result<Value, WorkflowError>;
}

/// Adapter turning an async closure into a [`WorkflowHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> WorkflowHandler for FnHandler<F>
where
    F: Fn(Arc<ExecutionContext>, BTreeMap<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, WorkflowError>> + Send,
{
    async fn run(
        &self,
        ctx: Arc<ExecutionContext>,
        parameters: BTreeMap<String, Value>,
    ) -> Result<Value, WorkflowError> {
        (self.0)(ctx, parameters).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn WorkflowHandler>
where
    F: Fn(Arc<ExecutionContext>, BTreeMap<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handler executing a workspace script through the script runtime.
struct ScriptHandler {
    name: String,
    source: String,
}

#[async_trait]
impl WorkflowHandler for ScriptHandler {
    async fn run(
        &self,
        ctx: Arc<ExecutionContext>,
        parameters: BTreeMap<String, Value>,
    ) -> Result<Value, WorkflowError> {
        let (result, variables) =
            script::execute_script(&self.name, &self.source, ctx.clone(), parameters).await;
        ctx.merge_captured(variables);
        result
    }
}

#[derive(Clone)]
struct Registered {
    metadata: WorkflowMetadata,
    handler: Arc<dyn WorkflowHandler>,
}

/// Registry of workflows and data providers.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, Registered>>,
    providers: RwLock<HashMap<String, Registered>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_workflow(
        &self,
        metadata: WorkflowMetadata,
        handler: Arc<dyn WorkflowHandler>,
    ) -> Result<(), WorkflowError> {
        let issues = validate_metadata(&metadata);
        if let Some(issue) = issues.first() {
            return Err(WorkflowError::Validation(issue.message.clone()));
        }
        self.workflows
            .write()
            .insert(metadata.name.clone(), Registered { metadata, handler });
        Ok(())
    }

    pub fn register_data_provider(
        &self,
        metadata: WorkflowMetadata,
        handler: Arc<dyn WorkflowHandler>,
    ) -> Result<(), WorkflowError> {
        let issues = validate_metadata(&metadata);
        if let Some(issue) = issues.first() {
            return Err(WorkflowError::Validation(issue.message.clone()));
        }
        self.providers
            .write()
            .insert(metadata.name.clone(), Registered { metadata, handler });
        Ok(())
    }

    pub fn get_workflow(
        &self,
        name: &str,
    ) -> Option<(WorkflowMetadata, Arc<dyn WorkflowHandler>)> {
        self.workflows
            .read()
            .get(name)
            .map(|r| (r.metadata.clone(), r.handler.clone()))
    }

    pub fn get_data_provider(
        &self,
        name: &str,
    ) -> Option<(WorkflowMetadata, Arc<dyn WorkflowHandler>)> {
        self.providers
            .read()
            .get(name)
            .map(|r| (r.metadata.clone(), r.handler.clone()))
    }

    pub fn workflow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Scan a workspace tree and (re-)register every valid script workflow.
    /// Invalid files are skipped with a warning and returned for tooling.
    pub fn load_workspace(&self, scanner: &WorkspaceScanner) -> Vec<(PathBuf, ValidationReport)> {
        let reports = scanner.scan();
        for (path, report) in &reports {
            if !report.valid {
                warn!(path = %path.display(), "Skipping invalid workspace script");
                continue;
            }
            let (Some(metadata), Ok(source)) =
                (report.metadata.clone(), std::fs::read_to_string(path))
            else {
                continue;
            };
            let handler = Arc::new(ScriptHandler {
                name: metadata.name.clone(),
                source,
            });
            let is_provider = metadata.tags.iter().any(|t| t == "data_provider");
            let registered = Registered {
                metadata: metadata.clone(),
                handler,
            };
            if is_provider {
                self.providers.write().insert(metadata.name.clone(), registered);
            } else {
                self.workflows.write().insert(metadata.name.clone(), registered);
            }
            debug!(name = %metadata.name, path = %path.display(), "Registered workspace script");
        }
        reports
    }
}

/// Recursive scanner over a workspace source tree.
pub struct WorkspaceScanner {
    root: PathBuf,
}

impl WorkspaceScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Validate every `.rhai` file under the root. Files are read fresh on
    /// each call.
    pub fn scan(&self) -> Vec<(PathBuf, ValidationReport)> {
        let mut files = Vec::new();
        collect_scripts(&self.root, &mut files);
        files.sort();
        files
            .into_iter()
            .map(|path| {
                let report = match std::fs::read_to_string(&path) {
                    Ok(source) => validate_script_source(&source),
                    Err(e) => ValidationReport::invalid(vec![ValidationIssue::error(
                        None,
                        format!("Failed to read file: {e}"),
                    )]),
                };
                (path, report)
            })
            .collect()
    }
}

fn collect_scripts(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_scripts(&path, files);
        } else if path.extension().is_some_and(|ext| ext == "rhai") {
            files.push(path);
        }
    }
}

/// Validate script source: syntax first, then the metadata header, then
/// each metadata rule in order.
pub fn validate_script_source(source: &str) -> ValidationReport {
    let mut issues = Vec::new();

    if let Err(e) = script::check_syntax(source) {
        issues.push(ValidationIssue::error(e.line, format!("Syntax error: {}", e.message)));
        return ValidationReport::invalid(issues);
    }

    let header = parse_header(source);
    if header.fields.is_empty() {
        issues.push(ValidationIssue::error(
            Some(1),
            "Missing workflow header: expected leading '//@ key: value' lines",
        ));
        return ValidationReport::invalid(issues);
    }

    let metadata = match build_metadata(&header, &mut issues) {
        Some(metadata) => metadata,
        None => return ValidationReport::invalid(issues),
    };

    for issue in validate_metadata(&metadata) {
        issues.push(issue);
    }

    let valid = issues.iter().all(|i| i.severity != bifrost_workflow::metadata::Severity::Error);
    ValidationReport {
        valid,
        issues,
        metadata: Some(metadata),
    }
}

/// Metadata rules shared by native registration and script validation.
pub fn validate_metadata(metadata: &WorkflowMetadata) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if !name_pattern().is_match(&metadata.name) {
        issues.push(ValidationIssue::error(
            None,
            format!(
                "Invalid workflow name '{}': must be lowercase snake_case (letters, numbers, underscores)",
                metadata.name
            ),
        ));
    }
    if metadata.description.trim().is_empty() {
        issues.push(ValidationIssue::error(None, "Description must not be empty"));
    }
    if metadata.timeout_seconds < MIN_TIMEOUT_SECONDS
        || metadata.timeout_seconds > MAX_TIMEOUT_SECONDS
    {
        issues.push(ValidationIssue::error(
            None,
            format!(
                "timeout_seconds {} out of bounds [{MIN_TIMEOUT_SECONDS}, {MAX_TIMEOUT_SECONDS}]",
                metadata.timeout_seconds
            ),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for parameter in &metadata.parameters {
        if !seen.insert(parameter.name.as_str()) {
            issues.push(ValidationIssue::error(
                None,
                format!("Duplicate parameter '{}'", parameter.name),
            ));
        }
    }

    issues
}

struct Header {
    fields: HashMap<String, (u32, String)>,
}

fn parse_header(source: &str) -> Header {
    let mut fields = HashMap::new();
    for (index, line) in source.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some(rest) = trimmed.strip_prefix("//@") else {
            break;
        };
        if let Some((key, value)) = rest.split_once(':') {
            fields.insert(
                key.trim().to_string(),
                (index as u32 + 1, value.trim().to_string()),
            );
        }
    }
    Header { fields }
}

fn build_metadata(header: &Header, issues: &mut Vec<ValidationIssue>) -> Option<WorkflowMetadata> {
    let Some((_, name)) = header.fields.get("name") else {
        issues.push(ValidationIssue::error(
            Some(1),
            "Missing required header field 'name'",
        ));
        return None;
    };
    let description = header
        .fields
        .get("description")
        .map(|(_, v)| v.clone())
        .unwrap_or_default();

    let mut metadata = WorkflowMetadata::new(name.clone(), description);

    if let Some((_, category)) = header.fields.get("category") {
        metadata.category = Some(category.clone());
    }
    if let Some((_, tags)) = header.fields.get("tags") {
        metadata.tags = tags
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
    }
    if let Some((line, mode)) = header.fields.get("execution_mode") {
        match ExecutionMode::parse(mode) {
            Some(parsed) => metadata.execution_mode = parsed,
            None => {
                issues.push(ValidationIssue::error(
                    Some(*line),
                    format!("Invalid execution mode '{mode}': must be 'sync' or 'async'"),
                ));
                return None;
            }
        }
    }
    if let Some((line, timeout)) = header.fields.get("timeout_seconds") {
        match timeout.parse::<u64>() {
            Ok(parsed) => metadata.timeout_seconds = parsed,
            Err(_) => {
                issues.push(ValidationIssue::error(
                    Some(*line),
                    format!("Invalid timeout_seconds '{timeout}'"),
                ));
                return None;
            }
        }
    }
    if let Some((line, cache_ttl)) = header.fields.get("cache_ttl_seconds") {
        match cache_ttl.parse::<u64>() {
            Ok(parsed) => metadata.cache_ttl_seconds = parsed,
            Err(_) => {
                issues.push(ValidationIssue::error(
                    Some(*line),
                    format!("Invalid cache_ttl_seconds '{cache_ttl}'"),
                ));
            }
        }
    }
    if let Some((line, raw)) = header.fields.get("parameters") {
        match parse_parameters(raw) {
            Ok(parameters) => metadata.parameters = parameters,
            Err(message) => {
                issues.push(ValidationIssue::error(Some(*line), message));
                return None;
            }
        }
    }
    if let Some((_, enabled)) = header.fields.get("endpoint_enabled") {
        metadata.endpoint_enabled = enabled == "true";
    }
    if let Some((_, methods)) = header.fields.get("allowed_methods") {
        metadata.allowed_methods = methods
            .split(',')
            .map(|m| m.trim().to_uppercase())
            .filter(|m| !m.is_empty())
            .collect();
    }

    Some(metadata)
}

fn parse_parameters(raw: &str) -> Result<Vec<ParameterDef>, String> {
    let values: Vec<Value> =
        serde_json::from_str(raw).map_err(|e| format!("Invalid parameters JSON: {e}"))?;
    let mut parameters = Vec::new();
    for value in values {
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| "Parameter missing 'name'".to_string())?
            .to_string();
        let type_str = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("Parameter '{name}' missing 'type'"))?;
        let param_type = ParameterType::parse(type_str)
            .ok_or_else(|| format!("Parameter '{name}' has unknown type '{type_str}'"))?;
        let mut def = ParameterDef::new(name, param_type);
        def.required = value.get("required").and_then(Value::as_bool).unwrap_or(false);
        def.default_value = value.get("default_value").cloned();
        def.help_text = value
            .get("help_text")
            .and_then(Value::as_str)
            .map(String::from);
        def.validation = value.get("validation").cloned();
        parameters.push(def);
    }
    Ok(parameters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const VALID_SCRIPT: &str = r#"//@ name: weekly_report
//@ description: Builds the weekly report
//@ execution_mode: async
//@ timeout_seconds: 300
//@ tags: reporting
//@ parameters: [{"name": "week", "type": "int", "required": true}]

let total = 1 + 2;
print(`total: ${total}`);
"#;

    #[test]
    fn test_valid_script_produces_metadata() {
        let report = validate_script_source(VALID_SCRIPT);
        assert!(report.valid, "issues: {:?}", report.issues);
        let metadata = report.metadata.unwrap();
        assert_eq!(metadata.name, "weekly_report");
        assert_eq!(metadata.execution_mode, ExecutionMode::Async);
        assert_eq!(metadata.timeout_seconds, 300);
        assert_eq!(metadata.parameters.len(), 1);
        assert_eq!(metadata.parameters[0].param_type, ParameterType::Int);
    }

    #[test]
    fn test_syntax_error_reported_with_line() {
        let source = "//@ name: broken\n//@ description: x\nlet a = ;\n";
        let report = validate_script_source(source);
        assert!(!report.valid);
        assert!(report.issues[0].message.starts_with("Syntax error"));
    }

    #[test]
    fn test_missing_header_is_invalid() {
        let report = validate_script_source("let a = 1;\n");
        assert!(!report.valid);
        assert!(report.issues[0].message.contains("header"));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let source = "//@ name: Bad-Name\n//@ description: x\nlet a = 1;\n";
        let report = validate_script_source(source);
        assert!(!report.valid);
        assert!(report.issues.iter().any(|i| i.message.contains("Invalid workflow name")));
    }

    #[test]
    fn test_timeout_bounds_enforced() {
        let source = "//@ name: slow\n//@ description: x\n//@ timeout_seconds: 9999\nlet a = 1;\n";
        let report = validate_script_source(source);
        assert!(!report.valid);
        assert!(report.issues.iter().any(|i| i.message.contains("out of bounds")));
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let source = "//@ name: x1\n//@ description: x\n//@ execution_mode: eventually\nlet a = 1;\n";
        let report = validate_script_source(source);
        assert!(!report.valid);
    }

    #[test]
    fn test_registry_register_and_lookup() {
        let registry = WorkflowRegistry::new();
        let metadata = WorkflowMetadata::new("sum_two", "Adds two numbers");
        registry
            .register_workflow(
                metadata,
                handler_fn(|_ctx, params| async move {
                    let x = params.get("x").and_then(Value::as_i64).unwrap_or(0);
                    let y = params.get("y").and_then(Value::as_i64).unwrap_or(0);
                    Ok(json!({"sum": x + y}))
                }),
            )
            .unwrap();

        assert!(registry.get_workflow("sum_two").is_some());
        assert!(registry.get_workflow("missing").is_none());
        assert!(registry.get_data_provider("sum_two").is_none());
    }

    #[test]
    fn test_registry_rejects_invalid_metadata() {
        let registry = WorkflowRegistry::new();
        let metadata = WorkflowMetadata::new("Not Valid", "desc");
        let result = registry.register_workflow(
            metadata,
            handler_fn(|_ctx, _params| async move { Ok(Value::Null) }),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_workspace_scan_fresh_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.rhai");
        std::fs::write(&path, VALID_SCRIPT).unwrap();

        let scanner = WorkspaceScanner::new(dir.path());
        let registry = WorkflowRegistry::new();
        let reports = registry.load_workspace(&scanner);
        assert_eq!(reports.len(), 1);
        assert!(reports[0].1.valid);
        assert!(registry.get_workflow("weekly_report").is_some());

        // Editing the file and rescanning picks up the change.
        std::fs::write(&path, VALID_SCRIPT.replace("weekly_report", "monthly_report")).unwrap();
        registry.load_workspace(&scanner);
        assert!(registry.get_workflow("monthly_report").is_some());
    }
}
