//! Error types for the catalog layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] maestro_crypto::CryptoError),

    /// The partial unique index on (freq_id, end_time IS NULL) rejected
    /// a second concurrent run. Callers treat this as "a ticker beat us
    /// to it", not as a failure.
    #[error("There already exists an unfinished run for freq_id {0} (end_time NULL).")]
    UnfinishedRunExists(i64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl CatalogError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// True when an insert bounced off the one-unfinished-run-per-
    /// frequency constraint.
    pub fn is_unfinished_run_conflict(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db) => {
                let msg = db.message();
                msg.contains("violates unique constraint")
                    && msg.contains("freq_id_end_time_null_idx")
            }
            _ => false,
        }
    }
}
