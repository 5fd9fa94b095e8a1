//! Chunk ledger operations

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteExecutor, SqlitePool};

use super::{from_unix, to_unix};
use crate::upload::ChunkRef;

/// Chunk ledger row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChunkRow {
    pub id: i64,
    pub session_id: String,
    pub chunk_index: i64,
    pub blob_name: String,
    pub fingerprint: String,
    pub received_at: i64,
}

impl From<ChunkRow> for ChunkRef {
    fn from(row: ChunkRow) -> Self {
        Self {
            id: row.id,
            session_id: row.session_id,
            index: row.chunk_index as u32,
            blob_name: row.blob_name,
            received_at: from_unix(row.received_at),
        }
    }
}

/// Chunk ledger repository
pub struct ChunkRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ChunkRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a chunk. Returns the new row id.
    pub async fn insert(
        &self,
        session_id: &str,
        index: u32,
        blob_name: &str,
        fingerprint: &str,
        received_at: DateTime<Utc>,
    ) -> sqlx::Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO uploaded_chunks (session_id, chunk_index, blob_name, fingerprint, received_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(i64::from(index))
        .bind(blob_name)
        .bind(fingerprint)
        .bind(to_unix(received_at))
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// All rows for a session, ascending by index then arrival
    pub async fn list_for_session(&self, session_id: &str) -> sqlx::Result<Vec<ChunkRow>> {
        sqlx::query_as::<_, ChunkRow>(
            r#"
            SELECT id, session_id, chunk_index, blob_name, fingerprint, received_at
            FROM uploaded_chunks
            WHERE session_id = ?
            ORDER BY chunk_index ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(self.pool)
        .await
    }

    /// Rows received strictly before `cutoff`
    pub async fn list_received_before(&self, cutoff: DateTime<Utc>) -> sqlx::Result<Vec<ChunkRow>> {
        sqlx::query_as::<_, ChunkRow>(
            r#"
            SELECT id, session_id, chunk_index, blob_name, fingerprint, received_at
            FROM uploaded_chunks
            WHERE received_at < ?
            ORDER BY id ASC
            "#,
        )
        .bind(to_unix(cutoff))
        .fetch_all(self.pool)
        .await
    }

    /// Whether a row received at or after `cutoff` still names `blob_name`
    pub async fn blob_referenced_since(&self, blob_name: &str, cutoff: DateTime<Utc>) -> sqlx::Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM uploaded_chunks WHERE blob_name = ? AND received_at >= ? LIMIT 1",
        )
        .bind(blob_name)
        .bind(to_unix(cutoff))
        .fetch_optional(self.pool)
        .await?;

        Ok(found.is_some())
    }

    /// Delete one row by primary key
    pub async fn delete(&self, id: i64) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM uploaded_chunks WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Delete chunk rows by primary key on any executor (pool or transaction)
pub async fn delete_chunk_rows<'e, E>(executor: E, ids: &[i64]) -> sqlx::Result<u64>
where
    E: SqliteExecutor<'e>,
{
    if ids.is_empty() {
        return Ok(0);
    }

    let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM uploaded_chunks WHERE id IN (");
    let mut separated = query.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");

    let result = query.build().execute(executor).await?;
    Ok(result.rows_affected())
}
