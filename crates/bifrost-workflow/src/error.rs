//! Error taxonomy shared across the execution pipeline.

use thiserror::Error;

/// Errors raised by workflow handlers and the surrounding pipeline.
///
/// The `error_type` string recorded on executions and returned to callers
/// comes from [`WorkflowError::error_type`]. `User` errors are the only kind
/// whose message is shown verbatim to non-admin callers.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Workflow '{0}' not found")]
    NotFound(String),

    #[error("Failed to load workflow '{name}': {reason}")]
    LoadError { name: String, reason: String },

    /// User-visible error; surfaced verbatim to all callers.
    #[error("{0}")]
    User(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// The `error_type` string written to the execution record.
    pub fn error_type(&self) -> &'static str {
        match self {
            WorkflowError::NotFound(_) => "WorkflowNotFound",
            WorkflowError::LoadError { .. } => "WorkflowLoadError",
            WorkflowError::User(_) => "UserError",
            WorkflowError::Validation(_) => "ValidationError",
            WorkflowError::Script(_) => "ScriptError",
            WorkflowError::Internal(_) => "InternalError",
        }
    }

    /// Whether the raw message may be shown to non-admin callers.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, WorkflowError::User(_))
    }
}

/// Generic message shown to non-admins in place of internal error details.
pub const GENERIC_ERROR_MESSAGE: &str = "An error occurred during execution";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_strings() {
        assert_eq!(
            WorkflowError::NotFound("x".into()).error_type(),
            "WorkflowNotFound"
        );
        assert_eq!(WorkflowError::User("bad input".into()).error_type(), "UserError");
        assert_eq!(
            WorkflowError::LoadError {
                name: "x".into(),
                reason: "syntax".into()
            }
            .error_type(),
            "WorkflowLoadError"
        );
    }

    #[test]
    fn test_only_user_errors_are_visible() {
        assert!(WorkflowError::User("oops".into()).is_user_visible());
        assert!(!WorkflowError::Internal("boom".into()).is_user_visible());
    }
}
