//! Remote execution contract
//!
//! The `eval.Eval` gRPC service: Compile / Execute / Clean, defined once in
//! `proto/eval.proto` and spoken by both the control process
//! (`RemoteEvaluator`) and the workers (`serve`).

pub mod client;
pub mod messages;
pub mod server;

pub use client::RemoteEvaluator;
pub use messages::{
    CleanArgs, CompileRequest, CompileResponse, Empty, RunStats, RunStatus, Test, TestResponse,
};
pub use server::{serve, serve_with_shutdown, EvalService};

use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::{Code, Status};

use crate::error::{ErrorKind, EvalError};

/// Largest message either side accepts
pub const MAX_MESSAGE_LEN: usize = 256 * 1024 * 1024;

/// Metadata key naming the side at fault when a worker fails a call
const ERROR_KIND_KEY: &str = "eval-error-kind";

/// Status a worker answers a failed call with
pub fn status_from_error(error: &EvalError) -> Status {
    let (code, kind) = match error {
        _ if error.is_user_error() => (Code::InvalidArgument, "user"),
        EvalError::SchedulerExhausted(_) => (Code::ResourceExhausted, "infrastructure"),
        EvalError::SchedulerClosed => (Code::Unavailable, "infrastructure"),
        _ => (Code::Internal, "infrastructure"),
    };
    let mut metadata = MetadataMap::new();
    metadata.insert(ERROR_KIND_KEY, MetadataValue::from_static(kind));
    Status::with_metadata(code, error.to_string(), metadata)
}

/// Classify a failed call on the client side.
///
/// Failures reported by a worker carry their classification and become
/// `Remote`. Anything else is judged by its code: connection trouble is
/// `Transport`, an undecodable or unknown reply is `MalformedResponse`.
pub fn error_from_status(status: &Status) -> EvalError {
    let message = status.message().to_string();
    let reported = status
        .metadata()
        .get(ERROR_KIND_KEY)
        .and_then(|value| value.to_str().ok());

    match (reported, status.code()) {
        (Some("user"), _) | (None, Code::InvalidArgument) => EvalError::Remote {
            kind: ErrorKind::User,
            message,
        },
        (Some(_), _) => EvalError::Remote {
            kind: ErrorKind::Infrastructure,
            message,
        },
        (None, Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled | Code::Unknown) => {
            EvalError::Transport(format!("{:?}: {}", status.code(), message))
        }
        (None, Code::Internal | Code::DataLoss | Code::Unimplemented) => {
            EvalError::MalformedResponse(format!("{:?}: {}", status.code(), message))
        }
        (None, _) => EvalError::Remote {
            kind: ErrorKind::Infrastructure,
            message,
        },
    }
}
