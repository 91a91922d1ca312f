//! Upload error taxonomy.
//!
//! Every variant maps to an HTTP status and a JSON `{"message": ...}`
//! body.  The enum implements [`axum::response::IntoResponse`] so
//! handlers can simply return `Err(UploadError::SessionNotFound { .. })`.
//!
//! Remote-store failures during completion and abort are *not* rendered
//! through this path; those handlers fold them into an `ok: false`
//! response body instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Header carrying the per-request identifier.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors surfaced by the upload coordinator and its HTTP layer.
#[derive(Debug, Error)]
pub enum UploadError {
    /// No session exists for the upload ID (never created, or already
    /// completed or aborted).
    #[error("UploadId {upload_id} could not be found")]
    SessionNotFound { upload_id: String },

    /// The session exists but was opened for a different object key.
    #[error("UploadId {upload_id} does not match file {key}")]
    SessionKeyMismatch { upload_id: String, key: String },

    /// The object key failed normalization.
    #[error("The name {name} is invalid")]
    InvalidName { name: String },

    /// A request argument is missing or malformed.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// Strict mode: a non-final part is below the remote minimum size.
    #[error("Part {part_number} is {size} bytes, below the minimum of {minimum} bytes for a non-final part")]
    EntityTooSmall {
        part_number: u32,
        size: u64,
        minimum: u64,
    },

    /// The part body exceeds the configured maximum.
    #[error("Part exceeds the maximum allowed size of {limit} bytes")]
    PartTooLarge { limit: u64 },

    /// The object store rejected the call or could not be reached.
    #[error("{0:#}")]
    RemoteStore(anyhow::Error),

    /// A bulk abort where the store refused some uploads.  `aborted`
    /// lists the ones it did abort; their sessions are already gone.
    #[error("{failed} uploads could not be aborted ({} aborted): {source:#}", .aborted.len())]
    PartialAbort {
        aborted: Vec<crate::gateway::backend::AbortedUpload>,
        failed: usize,
        #[source]
        source: anyhow::Error,
    },

    /// The session store failed before any remote call was issued.
    #[error("Session store unavailable: {0:#}")]
    SessionStore(anyhow::Error),

    /// The remote store accepted an operation but the local session
    /// record could not be updated to match.
    #[error("UploadId {upload_id}: {operation} succeeded remotely but local bookkeeping failed: {source:#}")]
    LocalBookkeeping {
        upload_id: String,
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("We encountered an internal error, please try again.")]
    Internal(#[from] anyhow::Error),
}

impl UploadError {
    /// Short machine-readable name, used for metric labels and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::SessionNotFound { .. } => "session_not_found",
            UploadError::SessionKeyMismatch { .. } => "session_key_mismatch",
            UploadError::InvalidName { .. } => "invalid_name",
            UploadError::InvalidArgument { .. } => "invalid_argument",
            UploadError::EntityTooSmall { .. } => "entity_too_small",
            UploadError::PartTooLarge { .. } => "part_too_large",
            UploadError::RemoteStore(_) => "remote_store",
            UploadError::PartialAbort { .. } => "partial_abort",
            UploadError::SessionStore(_) => "session_store",
            UploadError::LocalBookkeeping { .. } => "local_bookkeeping",
            UploadError::Internal(_) => "internal",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UploadError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            UploadError::SessionKeyMismatch { .. } => StatusCode::BAD_REQUEST,
            UploadError::InvalidName { .. } => StatusCode::BAD_REQUEST,
            UploadError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            UploadError::EntityTooSmall { .. } => StatusCode::BAD_REQUEST,
            UploadError::PartTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::RemoteStore(_) | UploadError::PartialAbort { .. } => {
                StatusCode::BAD_GATEWAY
            }
            UploadError::SessionStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::LocalBookkeeping { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client errors are never worth retrying without changing the request.
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.is_client_error() {
            tracing::debug!(kind = self.kind(), "request rejected: {self}");
        } else {
            tracing::warn!(kind = self.kind(), "request failed: {self}");
        }
        let body = ErrorBody {
            message: self.to_string(),
        };
        (
            status,
            [(REQUEST_ID_HEADER, generate_request_id())],
            Json(body),
        )
            .into_response()
    }
}
