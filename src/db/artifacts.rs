//! Artifact ledger operations

use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};

use super::{from_unix, to_unix};
use crate::upload::{ArtifactRecord, Fingerprint};

/// Artifact ledger row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ArtifactRow {
    pub id: i64,
    pub public_id: String,
    pub original_name: String,
    pub size_bytes: i64,
    pub created_at: i64,
    pub owner_fingerprint: String,
    pub collection_id: Option<String>,
    pub content_checksum: Option<String>,
}

impl From<ArtifactRow> for ArtifactRecord {
    fn from(row: ArtifactRow) -> Self {
        Self {
            public_id: row.public_id,
            original_name: row.original_name,
            size_bytes: row.size_bytes.max(0) as u64,
            created_at: from_unix(row.created_at),
            owner_fingerprint: Fingerprint::from_stored(row.owner_fingerprint),
            collection_id: row.collection_id,
            content_checksum: row.content_checksum,
        }
    }
}

const SELECT_ARTIFACT: &str = r#"
    SELECT id, public_id, original_name, size_bytes, created_at,
           owner_fingerprint, collection_id, content_checksum
    FROM artifacts
"#;

/// Artifact ledger repository
pub struct ArtifactRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ArtifactRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Get an artifact by its public identifier
    pub async fn get(&self, public_id: &str) -> sqlx::Result<Option<ArtifactRow>> {
        sqlx::query_as::<_, ArtifactRow>(&format!("{SELECT_ARTIFACT} WHERE public_id = ?"))
            .bind(public_id)
            .fetch_optional(self.pool)
            .await
    }

    /// Whether a public identifier is taken
    pub async fn exists(&self, public_id: &str) -> sqlx::Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM artifacts WHERE public_id = ?")
            .bind(public_id)
            .fetch_optional(self.pool)
            .await?;

        Ok(found.is_some())
    }

    /// Collection members in insertion order
    pub async fn list_collection(&self, collection_id: &str) -> sqlx::Result<Vec<ArtifactRow>> {
        sqlx::query_as::<_, ArtifactRow>(&format!(
            "{SELECT_ARTIFACT} WHERE collection_id = ? ORDER BY id ASC"
        ))
        .bind(collection_id)
        .fetch_all(self.pool)
        .await
    }

    /// Artifacts created strictly before `cutoff`
    pub async fn list_created_before(&self, cutoff: DateTime<Utc>) -> sqlx::Result<Vec<ArtifactRow>> {
        sqlx::query_as::<_, ArtifactRow>(&format!(
            "{SELECT_ARTIFACT} WHERE created_at < ? ORDER BY id ASC"
        ))
        .bind(to_unix(cutoff))
        .fetch_all(self.pool)
        .await
    }

    /// Delete one row by primary key
    pub async fn delete(&self, id: i64) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM artifacts WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Aggregates
    // ========================================================================

    /// Total bytes held by all artifacts
    pub async fn total_bytes(&self) -> sqlx::Result<u64> {
        let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(size_bytes), 0) FROM artifacts")
            .fetch_one(self.pool)
            .await?;

        Ok(total.max(0) as u64)
    }

    /// Bytes published by an uploader after `since`
    pub async fn bytes_since(&self, owner: &Fingerprint, since: DateTime<Utc>) -> sqlx::Result<u64> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(size_bytes), 0)
            FROM artifacts
            WHERE owner_fingerprint = ? AND created_at > ?
            "#,
        )
        .bind(owner.as_str())
        .bind(to_unix(since))
        .fetch_one(self.pool)
        .await?;

        Ok(total.max(0) as u64)
    }

    /// Artifacts published by an uploader after `since`
    pub async fn count_since(&self, owner: &Fingerprint, since: DateTime<Utc>) -> sqlx::Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM artifacts
            WHERE owner_fingerprint = ? AND created_at > ?
            "#,
        )
        .bind(owner.as_str())
        .bind(to_unix(since))
        .fetch_one(self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }
}

/// Insert an artifact on any executor (pool or transaction).
///
/// A taken `public_id` surfaces as a unique-constraint database error.
pub async fn insert_artifact<'e, E>(executor: E, record: &ArtifactRecord) -> sqlx::Result<i64>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO artifacts (public_id, original_name, size_bytes, created_at,
                               owner_fingerprint, collection_id, content_checksum)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.public_id)
    .bind(&record.original_name)
    .bind(record.size_bytes as i64)
    .bind(to_unix(record.created_at))
    .bind(record.owner_fingerprint.as_str())
    .bind(&record.collection_id)
    .bind(&record.content_checksum)
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}
