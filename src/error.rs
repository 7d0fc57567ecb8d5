//! Error taxonomy (spec §7).
//!
//! Two enums, not one: the host (HTTP facade + supervisor) and the worker
//! (harness + user code) run in different processes with different error
//! surfaces, so each gets its own `thiserror` type rather than forcing a
//! single enum to serve both sides of the IPC boundary.

use crate::manifest::ManifestError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use thiserror::Error;

/// Errors raised inside the worker process (harness + user model code).
///
/// `UserModelError` and `UnhandledWorkerException` are reported back to the
/// host as a `FAILED` IPC message (spec §4.4); they never abort the worker
/// process uncaught.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Raised by user code via the host-defined user-error kind. Carries a
    /// user-safe message and a JSON-sanitized data payload.
    #[error("{msg}")]
    UserModelError { msg: String, data: Value },

    /// Any other error surfaced by user code.
    #[error("{msg}")]
    UnhandledWorkerException { msg: String, developer_msg: String },

    /// An output grid port's upload client authority did not match the
    /// configured read-catalog authority (spec §4.2 "Upload policy").
    #[error("cannot upload to {got}: configured read catalog is {expected}")]
    CrossEnvironmentUpload { expected: String, got: String },

    /// The manifest named no callable for `jobRequest.modelId`.
    #[error("no entrypoint registered for model id {0:?}")]
    EntrypointNotFound(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, ExecutionError>;

impl ExecutionError {
    /// Build the `state.exception` payload for this error (spec §4.4, §7).
    pub fn into_exception(self, model_id: &str) -> crate::ipc::ExceptionPayload {
        match self {
            ExecutionError::UserModelError { msg, data } => crate::ipc::ExceptionPayload {
                developer_msg: msg.clone(),
                msg,
                data,
                model_id: model_id.to_string(),
            },
            ExecutionError::UnhandledWorkerException { msg, developer_msg } => {
                crate::ipc::ExceptionPayload {
                    developer_msg,
                    msg,
                    data: Value::Null,
                    model_id: model_id.to_string(),
                }
            }
            other => crate::ipc::ExceptionPayload {
                developer_msg: other.to_string(),
                msg: other.to_string(),
                data: Value::Null,
                model_id: model_id.to_string(),
            },
        }
    }
}

/// Errors raised by the HTTP facade / supervisor on the host side.
///
/// Corresponds to spec §7's `RequestValidationError`: returned directly as
/// an HTTP status, never wrapped in `state.exception`.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("a job is already running")]
    JobAlreadyRunning,

    #[error("missing required field \"modelId\"")]
    MissingModelId,

    #[error("unknown model id {0:?}")]
    UnknownModel(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for HostError {
    fn into_response(self) -> Response {
        let status = match &self {
            HostError::JobAlreadyRunning => StatusCode::CONFLICT,
            HostError::MissingModelId => StatusCode::BAD_REQUEST,
            HostError::UnknownModel(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HostError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
