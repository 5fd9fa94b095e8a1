//! Database module for SQLite persistence
//!
//! Holds the chunk ledger, the artifact ledger and the audit log.

mod artifacts;
mod audit;
mod chunks;
mod schema;

pub use artifacts::*;
pub use audit::*;
pub use chunks::*;
pub use schema::*;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Result;

/// How long a writer waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a new database connection pool from a `sqlite:` URL
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?;
    open(options).await
}

/// Create a new database connection pool for a database file
pub async fn create_pool_at(path: &Path) -> Result<SqlitePool> {
    open(SqliteConnectOptions::new().filename(path)).await
}

async fn open(options: SqliteConnectOptions) -> Result<SqlitePool> {
    let options = options
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // Run migrations
    initialize_schema(&pool).await?;

    Ok(pool)
}

/// Ledger timestamps are unix seconds
pub(crate) fn to_unix(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
