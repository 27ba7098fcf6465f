use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use sqlx::Error as SqlxError;
use std::fmt;
use thiserror::Error as ThisError;

pub type Result<T, E = TempDbError> = std::result::Result<T, E>;

/// Which bookkeeping resource a uniqueness conflict was raised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Database,
    User,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Database => f.write_str("database"),
            ResourceKind::User => f.write_str("user"),
        }
    }
}

/// Why an operation context stopped the work it was guarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum ContextError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, ThisError)]
pub enum TempDbError {
    #[error("cannot connect to {target}: {source}")]
    Connection {
        target: String,
        #[source]
        source: SqlxError,
    },

    #[error("cannot initialize {step}: {source}")]
    Initialization {
        step: &'static str,
        #[source]
        source: Box<TempDbError>,
    },

    #[error("{kind} {name:?} already exists")]
    DuplicateResource { kind: ResourceKind, name: String },

    #[error("cannot {operation} {target:?}: {source}")]
    Provisioning {
        operation: &'static str,
        target: String,
        #[source]
        source: Box<TempDbError>,
    },

    #[error("cannot {operation} {target:?}: {source}")]
    Reclamation {
        operation: &'static str,
        target: String,
        #[source]
        source: Box<TempDbError>,
    },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("invalid identifier {name:?}: {reason}")]
    InvalidIdentifier { name: String, reason: &'static str },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("backend is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("backend {0:?} is not registered")]
    BackendNotFound(String),

    #[error("backend {0:?} is already registered")]
    DuplicateBackend(String),

    #[error("backend name must not be empty")]
    InvalidBackendName,

    #[error("administrative statement `{statement}` failed: {source}")]
    Admin {
        statement: &'static str,
        #[source]
        source: SqlxError,
    },

    #[error("cannot commit unit of work: {0}")]
    Commit(#[source] Box<TempDbError>),

    #[error("Metadata store error: {0}")]
    Store(#[from] SqlxError),
}

impl TempDbError {
    /// Wrap a failed administrative step of `create`. Cancellation and
    /// uniqueness errors pass through untouched.
    pub fn provisioning(operation: &'static str, target: &str, err: TempDbError) -> Self {
        match err {
            e @ (TempDbError::Context(_) | TempDbError::DuplicateResource { .. }) => e,
            e => TempDbError::Provisioning {
                operation,
                target: target.to_string(),
                source: Box::new(e),
            },
        }
    }

    /// Wrap a failed administrative step of the expiration sweep.
    pub fn reclamation(operation: &'static str, target: &str, err: TempDbError) -> Self {
        match err {
            e @ TempDbError::Context(_) => e,
            e => TempDbError::Reclamation {
                operation,
                target: target.to_string(),
                source: Box::new(e),
            },
        }
    }

    /// Transient failures worth another attempt: the server was unreachable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TempDbError::Connection { .. })
    }

    pub fn is_context(&self) -> bool {
        matches!(self, TempDbError::Context(_))
    }

    /// SQLSTATE of the underlying database error, when there is one.
    pub fn sqlstate(&self) -> Option<String> {
        let source = match self {
            TempDbError::Connection { source, .. }
            | TempDbError::Admin { source, .. }
            | TempDbError::Store(source) => source,
            TempDbError::Initialization { source, .. }
            | TempDbError::Provisioning { source, .. }
            | TempDbError::Reclamation { source, .. }
            | TempDbError::Commit(source) => return source.sqlstate(),
            _ => return None,
        };
        sqlstate_of(source)
    }
}

pub(crate) fn sqlstate_of(err: &SqlxError) -> Option<String> {
    match err {
        SqlxError::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}

impl IntoResponse for TempDbError {
    fn into_response(self) -> axum::response::Response {
        let (status, code, message) = match &self {
            TempDbError::BackendNotFound(_) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "Backend not found.".to_string(),
            ),
            TempDbError::DuplicateResource { .. } => {
                (StatusCode::CONFLICT, "CONFLICT", self.to_string())
            }
            TempDbError::InvalidIdentifier { .. } | TempDbError::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", self.to_string())
            }
            TempDbError::InvalidState { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "NOT_READY",
                "Backend is not ready.".to_string(),
            ),
            TempDbError::Context(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "TIMEOUT",
                "The operation did not finish in time.".to_string(),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal server error occurred.".to_string(),
            ),
        };
        let body = ApiErrorBody {
            code: code.to_string(),
            message,
        };
        (status, Json(ApiErrorResponse { error: body })).into_response()
    }
}

/// Standardized API error response body
#[derive(Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorBody,
}
