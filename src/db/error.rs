use std::path::PathBuf;

use sqlx::error::ErrorKind;
use thiserror::Error;

/// Failures surfaced by the persistence layer. Missing rows are not errors;
/// read operations return `Option` or an empty `Vec` instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    Constraint(#[source] sqlx::Error),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("session cancelled; staged changes were rolled back")]
    Cancelled,
    #[error("invalid cursor {value} for channel {channel_id}: must be >= 0")]
    InvalidCursor { channel_id: i64, value: i64 },
    #[error("cannot create database directory {}: {source}", path.display())]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_constraint_violation(&err) {
            StoreError::Constraint(err)
        } else {
            StoreError::Database(err)
        }
    }
}

impl StoreError {
    pub fn is_constraint(&self) -> bool {
        matches!(self, StoreError::Constraint(_))
    }
}

fn is_constraint_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if !matches!(db_err.kind(), ErrorKind::Other)
    )
}
