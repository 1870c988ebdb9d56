//! Persistence layer: the store contract, its SQLite session, and pool setup.
//!
//! - `store`: the [`ArchiveStore`] trait drivers are written against.
//! - `session`: [`SqliteSession`], the unit of work implementing it.
//! - `model`: read/view rows returned by the accessors.
//! - `error`: [`StoreError`].

pub mod error;
pub mod model;
pub mod session;
pub mod store;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use crate::config::Database as DatabaseConfig;

pub use error::StoreError;
pub use model::MessageRecord;
pub use session::SqliteSession;
pub use store::ArchiveStore;

pub type Pool = SqlitePool;

#[instrument(skip_all)]
pub async fn init_pool(database_url: &str, cfg: &DatabaseConfig) -> Result<Pool, StoreError> {
    let normalized = prepare_sqlite_url(database_url)?;
    debug!(url = %normalized, "opening database");
    // WAL lets the media driver read while an ingest session writes.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_millis(cfg.busy_timeout_ms));
    let pool = SqlitePoolOptions::new()
        .max_connections(cfg.max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Expand a leading `~/` in a file-backed SQLite URL and make sure the parent
/// directory exists. In-memory URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> Result<String, StoreError> {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return Ok(url.to_string());
    };
    if rest.starts_with(":memory") {
        return Ok(url.to_string());
    }

    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path.is_empty() {
        return Ok(url.to_string());
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::DataDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    Ok(match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    })
}

pub async fn run_migrations(pool: &Pool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
