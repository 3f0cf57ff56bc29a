//! Error taxonomy for the ingestion and clustering engine.
//!
//! Validation, not-found, conflict and corruption errors are distinct variants
//! so the outer API layer can map them to status codes. Per-photo ingestion
//! failures are not errors; they are reported inside [`crate::IngestReport`].

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt data: {0}")]
    Corruption(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("photo source failed: {0}")]
    Source(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn not_found(entity: &'static str, id: i64) -> Self {
        Error::NotFound { entity, id }
    }

    /// Returns true if repeating the same call later may succeed.
    ///
    /// Corruption is never retryable: the stored data has to be repaired first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Conflict(_) | Error::Timeout(_) => true,
            Error::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
