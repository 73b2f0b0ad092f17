//! Error types for strata-data
//!
//! Only pool and datastore failures reach callers. Cache backend and
//! instrumentation failures are logged and absorbed where they happen.

use strata_core::StrataError;
use thiserror::Error;

pub type DataResult<T> = Result<T, DataError>;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("pool '{pool}' exhausted after {attempts} attempts")]
    PoolExhausted { pool: String, attempts: u32 },

    #[error("unknown pool '{0}'")]
    UnknownPool(String),

    #[error("pool '{pool}' could not open a session: {reason}")]
    Connect { pool: String, reason: String },

    #[error("pool manager is shutting down")]
    ShuttingDown,

    #[error("not found: {resource} '{id}'")]
    NotFound { resource: &'static str, id: String },

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Config(#[from] StrataError),
}

impl DataError {
    pub fn store(reason: impl Into<String>) -> Self {
        Self::Store(reason.into())
    }

    /// True for errors raised by pool admission control rather than the datastore.
    pub fn is_pool_error(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::UnknownPool(_) | Self::ShuttingDown
        )
    }
}
