use http::StatusCode;
use sea_orm::error::{DbErr, RuntimeErr};
use serde::Serialize;

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient stock for part {part_id}: requested {requested}, on hand {on_hand}")]
    InsufficientStock {
        part_id: i32,
        requested: i32,
        on_hand: i32,
    },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Transient storage failure: {0}")]
    TransientStorageFailure(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) | Self::ValidationError(_) | Self::InvalidStatus(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InsufficientStock { .. } => StatusCode::CONFLICT,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::TransientStorageFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::DatabaseError(_)
            | Self::EventError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for callers outside the core.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::EventError(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Whether the operation may succeed if retried as-is.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientStorageFailure(_) => true,
            Self::DatabaseError(err) => is_transient_db_error(err),
            _ => false,
        }
    }
}

/// Classifies storage errors that a bounded retry can resolve: pool exhaustion,
/// lost connections, deadlocks, serialization failures and lock timeouts.
pub fn is_transient_db_error(err: &DbErr) -> bool {
    match err {
        DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => true,
        DbErr::Exec(RuntimeErr::SqlxError(e)) | DbErr::Query(RuntimeErr::SqlxError(e)) => {
            let message = e.to_string().to_ascii_lowercase();
            TRANSIENT_MARKERS.iter().any(|m| message.contains(m))
        }
        DbErr::Exec(RuntimeErr::Internal(message)) | DbErr::Query(RuntimeErr::Internal(message)) => {
            let message = message.to_ascii_lowercase();
            TRANSIENT_MARKERS.iter().any(|m| message.contains(m))
        }
        _ => false,
    }
}

const TRANSIENT_MARKERS: &[&str] = &[
    "deadlock detected",
    "could not serialize access",
    "lock timeout",
    "database is locked",
    "database table is locked",
];
