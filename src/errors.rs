//! Typed error hierarchy for the fabtrack service.
//!
//! Storage code returns `anyhow::Result` and raises a `TrackerError` where the
//! caller has to react to the failure kind. The HTTP layer digs the typed
//! error back out of the `anyhow` chain with [`TrackerError::find`].

use fabtrack_common::WorkflowError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Can't delete {kind}: {reason}")]
    InUse { kind: &'static str, reason: String },

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Permission denied: {0}")]
    Forbidden(String),

    #[error("Password reset failed: {0}")]
    PasswordReset(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrackerError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl ToString) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.to_string(),
        }
    }

    pub fn in_use(kind: &'static str, reason: impl ToString) -> Self {
        Self::InUse {
            kind,
            reason: reason.to_string(),
        }
    }

    /// Finds the first typed error in an `anyhow` chain.
    pub fn find(err: &anyhow::Error) -> Option<&TrackerError> {
        err.chain().find_map(|e| e.downcast_ref::<TrackerError>())
    }

    /// Finds a workflow rejection, raised directly or wrapped in a `TrackerError`.
    pub fn find_workflow(err: &anyhow::Error) -> Option<&WorkflowError> {
        err.chain().find_map(|e| {
            e.downcast_ref::<WorkflowError>().or_else(|| match e.downcast_ref::<TrackerError>() {
                Some(TrackerError::Workflow(w)) => Some(w),
                _ => None,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn not_found_carries_kind_and_id() {
        let err = TrackerError::not_found("Job", "42");
        match &err {
            TrackerError::NotFound { kind, id } => {
                assert_eq!(*kind, "Job");
                assert_eq!(id, "42");
            }
            _ => panic!("Expected NotFound"),
        }
        assert_eq!(err.to_string(), "Job 42 not found");
    }

    #[test]
    fn workflow_error_converts() {
        let err: TrackerError = WorkflowError::ProcedureFinished.into();
        assert!(matches!(
            err,
            TrackerError::Workflow(WorkflowError::ProcedureFinished)
        ));
    }

    #[test]
    fn find_sees_through_context() {
        let result: anyhow::Result<()> =
            Err(TrackerError::already_exists("State", "Transport").into());
        let err = result.context("Failed to create state").unwrap_err();
        assert!(matches!(
            TrackerError::find(&err),
            Some(TrackerError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn find_workflow_sees_direct_and_wrapped() {
        let direct: anyhow::Error = WorkflowError::JobComplete.into();
        assert_eq!(
            TrackerError::find_workflow(&direct),
            Some(&WorkflowError::JobComplete)
        );
        let wrapped: anyhow::Error =
            TrackerError::from(WorkflowError::StopJob("Job is pending.".into())).into();
        assert!(matches!(
            TrackerError::find_workflow(&wrapped),
            Some(WorkflowError::StopJob(_))
        ));
        let other = anyhow::anyhow!("disk full");
        assert!(TrackerError::find_workflow(&other).is_none());
    }

    #[test]
    fn all_errors_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&TrackerError::Unauthorized);
        assert_std_error(&WorkflowError::ProcedureFinished);
    }
}
