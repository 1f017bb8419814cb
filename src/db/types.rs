//! Shared type definitions for the store layer.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors specific to store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("Store is busy: {0}")]
    Busy(String),

    #[error("Duplicate key violates {index}: {detail}")]
    Duplicate { index: String, detail: String },

    #[error("Failed to (de)serialize account document: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, detail) => match code.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    StoreError::Busy(err.to_string())
                }
                ErrorCode::ConstraintViolation => StoreError::Duplicate {
                    index: constraint_name(detail.as_deref()),
                    detail: err.to_string(),
                },
                _ => StoreError::Sqlite(err),
            },
            _ => StoreError::Sqlite(err),
        }
    }
}

/// Pull the offending index/column out of a SQLite constraint message.
///
/// "UNIQUE constraint failed: accounts.group_key" → "accounts.group_key"
fn constraint_name(detail: Option<&str>) -> String {
    detail
        .and_then(|d| d.split_once("failed:"))
        .map(|(_, rest)| rest.trim().to_string())
        .unwrap_or_else(|| "unique index".to_string())
}

/// Errors that may succeed when the whole transaction is attempted again.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

/// Selection predicates understood by every store backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountFilter {
    /// Exact identifier match.
    Id(String),
    /// Case-insensitive email match.
    Email(String),
    /// Case-insensitive `*@domain` match, consolidated accounts excluded.
    EmailDomain(String),
    /// The consolidated account owning `group_key`.
    ConsolidatorFor(String),
    /// Member accounts pointing at `group_key`.
    MembersOf(String),
}
