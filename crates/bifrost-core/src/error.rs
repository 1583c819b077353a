//! Error types for the execution pipeline.

use bifrost_workflow::WorkflowError;
use thiserror::Error;

use crate::storage::StorageError;

/// Errors raised by the engine, pool, consumer and dispatcher.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Execution cancelled by user")]
    Cancelled,

    #[error("Execution exceeded timeout of {0} seconds")]
    Timeout(u64),

    #[error("Worker process exited with code {0}")]
    WorkerCrash(i32),

    #[error("Worker completed but no result found")]
    NoResult,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// The `error_type` string recorded on failed executions. `Cancelled`
    /// maps to none: cancellation is a status, not an error.
    pub fn error_type(&self) -> Option<&'static str> {
        match self {
            EngineError::Workflow(e) => Some(e.error_type()),
            EngineError::Storage(_) | EngineError::Queue(_) | EngineError::Internal(_) => {
                Some("InternalError")
            }
            EngineError::Cancelled => None,
            EngineError::Timeout(_) => Some("TimeoutError"),
            EngineError::WorkerCrash(_) => Some("WorkerCrash"),
            EngineError::NoResult => Some("NoResult"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_mapping() {
        assert_eq!(EngineError::Timeout(30).error_type(), Some("TimeoutError"));
        assert_eq!(EngineError::Cancelled.error_type(), None);
        assert_eq!(EngineError::WorkerCrash(9).error_type(), Some("WorkerCrash"));
        assert_eq!(
            EngineError::Workflow(WorkflowError::NotFound("x".into())).error_type(),
            Some("WorkflowNotFound")
        );
    }
}
