//! Error types for txqueue.
//!
//! Expected business conditions (missing rows, closed or expired
//! transactions, bad names) are ordinary variants; the caller gets a
//! [`ResultCode`] for each. Storage failures are opaque to callers and
//! surface as [`ResultCode::Unknown`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::TransactionId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} is closed")]
    Closed(TransactionId),

    #[error("{0} has expired")]
    Expired(TransactionId),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The result code reported to clients for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            Error::NotFound(_) => ResultCode::NotFound,
            Error::AlreadyExists(_) => ResultCode::AlreadyExists,
            Error::InvalidArgument(_) => ResultCode::InvalidArgument,
            Error::Closed(_) => ResultCode::Closed,
            Error::Expired(_) => ResultCode::Expired,
            Error::Storage(_) | Error::Migrate(_) | Error::Config(_) | Error::Other(_) => {
                ResultCode::Unknown
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome codes carried on every RPC response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Ok,
    NotFound,
    AlreadyExists,
    InvalidArgument,
    Closed,
    Expired,
    Unknown,
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultCode::Ok => "ok",
            ResultCode::NotFound => "not_found",
            ResultCode::AlreadyExists => "already_exists",
            ResultCode::InvalidArgument => "invalid_argument",
            ResultCode::Closed => "closed",
            ResultCode::Expired => "expired",
            ResultCode::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}
