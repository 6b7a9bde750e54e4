//! Error types for the grading core
//!
//! Every failure is classified as either a user-input problem (bad checker
//! source, unknown language, malformed request) or an infrastructure problem
//! (no box available, box crashed, transport failure). Callers use the
//! classification to decide between showing a verdict and retrying the job.

use std::path::PathBuf;
use std::time::Duration;

/// Who is responsible for a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The submitted code or request is at fault. Never retried.
    User,
    /// The judge itself failed. The outcome of the job is unknown.
    Infrastructure,
}

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("invalid helper code")]
    InvalidHelperCode { diagnostics: String },

    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no box became available within {0:?}")]
    SchedulerExhausted(Duration),

    #[error("box scheduler is shut down")]
    SchedulerClosed,

    #[error("failed to start box {box_id}: {reason}")]
    BoxStart { box_id: u32, reason: String },

    #[error("box {box_id} did not terminate within the grace period")]
    BoxUnresponsive { box_id: u32 },

    #[error("sandbox operation failed: {0}")]
    Sandbox(String),

    #[error("compiled artifact not found: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("malformed task output: {0}")]
    MalformedOutput(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("remote worker error: {message}")]
    Remote { kind: ErrorKind, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EvalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EvalError::InvalidHelperCode { .. }
            | EvalError::UnknownLanguage(_)
            | EvalError::InvalidRequest(_) => ErrorKind::User,
            EvalError::Remote { kind, .. } => *kind,
            _ => ErrorKind::Infrastructure,
        }
    }

    pub fn is_user_error(&self) -> bool {
        self.kind() == ErrorKind::User
    }

    /// Transport-level failures, where the worker may never have seen the call
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            EvalError::Transport(_) | EvalError::MalformedResponse(_)
        )
    }
}

/// Failure of `Checker::prepare`, carrying the text shown to the problem author
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct PrepareError {
    pub message: String,
    #[source]
    pub source: EvalError,
}

impl PrepareError {
    pub fn new(message: impl Into<String>, source: EvalError) -> Self {
        Self {
            message: message.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

pub type Result<T, E = EvalError> = std::result::Result<T, E>;
