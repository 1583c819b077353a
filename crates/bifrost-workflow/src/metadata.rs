//! Workflow metadata and validation types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default timeout applied when metadata does not specify one.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 1800;

/// Default TTL for data-provider result caching.
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 300;

/// Bounds enforced on declared timeouts.
pub const MIN_TIMEOUT_SECONDS: u64 = 1;
pub const MAX_TIMEOUT_SECONDS: u64 = 7200;

/// How a workflow is dispatched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sync,
    Async,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sync => "sync",
            ExecutionMode::Async => "async",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(ExecutionMode::Sync),
            "async" => Some(ExecutionMode::Async),
            _ => None,
        }
    }
}

/// Declared parameter types. Strings arriving from query/form payloads are
/// coerced to the declared type before the handler sees them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Int,
    Float,
    Bool,
    Email,
    Text,
    Json,
    List,
}

impl ParameterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Int => "int",
            ParameterType::Float => "float",
            ParameterType::Bool => "bool",
            ParameterType::Email => "email",
            ParameterType::Text => "text",
            ParameterType::Json => "json",
            ParameterType::List => "list",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(ParameterType::String),
            "int" => Some(ParameterType::Int),
            "float" => Some(ParameterType::Float),
            "bool" => Some(ParameterType::Bool),
            "email" => Some(ParameterType::Email),
            "text" => Some(ParameterType::Text),
            "json" => Some(ParameterType::Json),
            "list" => Some(ParameterType::List),
            _ => None,
        }
    }
}

/// A declared workflow parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDef {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<Value>,
}

impl ParameterDef {
    pub fn new(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            default_value: None,
            help_text: None,
            validation: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Metadata attached to a registered workflow or data provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    /// Must match `^[a-z0-9_]+$`.
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,
    #[serde(default)]
    pub endpoint_enabled: bool,
    #[serde(default)]
    pub allowed_methods: Vec<String>,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL_SECONDS
}

impl WorkflowMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category: None,
            tags: Vec::new(),
            execution_mode: ExecutionMode::Sync,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            cache_ttl_seconds: DEFAULT_CACHE_TTL_SECONDS,
            parameters: Vec::new(),
            endpoint_enabled: false,
            allowed_methods: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_parameter(mut self, parameter: ParameterDef) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Severity of a validation issue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One problem found while validating a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    pub fn error(line: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
            severity: Severity::Error,
        }
    }

    pub fn warning(line: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
            severity: Severity::Warning,
        }
    }
}

/// Outcome of validating a workflow file or metadata block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<WorkflowMetadata>,
}

impl ValidationReport {
    pub fn invalid(issues: Vec<ValidationIssue>) -> Self {
        Self {
            valid: false,
            issues,
            metadata: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_defaults() {
        let json = r#"{"name": "sum_two", "description": "Adds two numbers"}"#;
        let metadata: WorkflowMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.execution_mode, ExecutionMode::Sync);
        assert_eq!(metadata.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
        assert_eq!(metadata.cache_ttl_seconds, DEFAULT_CACHE_TTL_SECONDS);
        assert!(metadata.parameters.is_empty());
    }

    #[test]
    fn test_parameter_type_wire_names() {
        assert_eq!(ParameterType::parse("bool"), Some(ParameterType::Bool));
        assert_eq!(ParameterType::parse("decimal"), None);
        let def = ParameterDef::new("count", ParameterType::Int).required();
        let value = serde_json::to_value(&def).unwrap();
        assert_eq!(value["type"], "int");
        assert_eq!(value["required"], true);
    }
}
