//! Errors raised by the state progression rules.

use thiserror::Error;

/// A workflow transition that the current job or procedure state does not allow.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Procedure is already finished")]
    ProcedureFinished,

    #[error("Job has no procedure left to start")]
    JobComplete,

    #[error("Can't execute state: {0}")]
    Execution(String),

    #[error("Can't finish state: {0}")]
    Finish(String),

    #[error("Can't start job: {0}")]
    StartJob(String),

    #[error("Can't stop job: {0}")]
    StopJob(String),

    #[error("Can't collect job: {0}")]
    Collecting(String),

    #[error("Can't deliver job: {0}")]
    Delivering(String),
}
