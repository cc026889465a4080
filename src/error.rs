//! # Error Taxonomy
//!
//! Every failure that crosses a process boundary is expressed as a
//! [`DeltaError`] kind and mapped onto the REST and gRPC surfaces from a
//! single place. Subsystems keep their own narrow error enums and convert
//! into the taxonomy at the edge, so low-level detail (paths, key material,
//! nonces) never leaks to clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// System-wide error taxonomy, surfaced as status codes over REST and gRPC.
#[derive(Error, Debug)]
pub enum DeltaError {
    /// Malformed request, missing required fields, unsupported operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Credential missing or invalid.
    #[error("unauthenticated")]
    Unauthenticated,

    /// Credential valid but lacks the required permission.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Credential expired (subcategory of Unauthenticated for client UX).
    #[error("credential expired")]
    Expired,

    /// Entity or schema missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Schema validation rejected the document.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Concurrent write detected.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No Processing Worker available, or the master key has not yet been
    /// distributed to the worker handling the request.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Storage I/O, decrypt failure, or any unexpected condition. The
    /// message stays opaque to clients.
    #[error("internal error")]
    Internal,
}

pub type DeltaResult<T> = Result<T, DeltaError>;

/// JSON error body returned by the REST surface.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl DeltaError {
    /// Stable machine-readable kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            DeltaError::InvalidArgument(_) => "invalid_argument",
            DeltaError::Unauthenticated => "unauthenticated",
            DeltaError::PermissionDenied(_) => "permission_denied",
            DeltaError::Expired => "expired",
            DeltaError::NotFound(_) => "not_found",
            DeltaError::ValidationFailed(_) => "validation_failed",
            DeltaError::Conflict(_) => "conflict",
            DeltaError::Unavailable(_) => "unavailable",
            DeltaError::Internal => "internal",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            DeltaError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            DeltaError::Unauthenticated | DeltaError::Expired => StatusCode::UNAUTHORIZED,
            DeltaError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            DeltaError::NotFound(_) => StatusCode::NOT_FOUND,
            DeltaError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DeltaError::Conflict(_) => StatusCode::CONFLICT,
            DeltaError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DeltaError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn client_detail(&self) -> Option<String> {
        match self {
            DeltaError::InvalidArgument(d)
            | DeltaError::PermissionDenied(d)
            | DeltaError::NotFound(d)
            | DeltaError::ValidationFailed(d)
            | DeltaError::Conflict(d)
            | DeltaError::Unavailable(d) => Some(d.clone()),
            DeltaError::Unauthenticated | DeltaError::Expired | DeltaError::Internal => None,
        }
    }
}

impl IntoResponse for DeltaError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind(),
            detail: self.client_detail(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<DeltaError> for tonic::Status {
    fn from(err: DeltaError) -> Self {
        let detail = err.client_detail().unwrap_or_default();
        match err {
            DeltaError::InvalidArgument(_) => tonic::Status::invalid_argument(detail),
            DeltaError::Unauthenticated => tonic::Status::unauthenticated("unauthenticated"),
            DeltaError::Expired => tonic::Status::unauthenticated("credential expired"),
            DeltaError::PermissionDenied(_) => tonic::Status::permission_denied(detail),
            DeltaError::NotFound(_) => tonic::Status::not_found(detail),
            DeltaError::ValidationFailed(_) => tonic::Status::failed_precondition(detail),
            DeltaError::Conflict(_) => tonic::Status::aborted(detail),
            DeltaError::Unavailable(_) => tonic::Status::unavailable(detail),
            DeltaError::Internal => tonic::Status::internal("internal error"),
        }
    }
}

impl From<tonic::Status> for DeltaError {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;
        let msg = status.message().to_string();
        match status.code() {
            Code::InvalidArgument => DeltaError::InvalidArgument(msg),
            Code::Unauthenticated => DeltaError::Unauthenticated,
            Code::PermissionDenied => DeltaError::PermissionDenied(msg),
            Code::NotFound => DeltaError::NotFound(msg),
            Code::FailedPrecondition => DeltaError::ValidationFailed(msg),
            Code::Aborted => DeltaError::Conflict(msg),
            Code::Unavailable => DeltaError::Unavailable(msg),
            _ => DeltaError::Internal,
        }
    }
}
