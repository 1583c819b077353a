//! # bifrost-workflow
//!
//! Core domain types for the bifrost execution engine:
//! - Execution records and the status state machine
//! - Per-execution log entries
//! - Workflow metadata and parameter definitions
//! - The queue message contract
//! - The shared error taxonomy

pub mod error;
pub mod execution;
pub mod log;
pub mod message;
pub mod metadata;
pub mod status;

pub use error::WorkflowError;
pub use execution::{
    ResourceMetrics, ResultKind, WorkerResult, WorkflowExecution,
};
pub use log::{LogEntry, LogLevel, LogSource};
pub use message::ExecutionMessage;
pub use metadata::{
    ExecutionMode, ParameterDef, ParameterType, Severity, ValidationIssue, ValidationReport,
    WorkflowMetadata,
};
pub use status::ExecutionStatus;
