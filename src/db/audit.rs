//! Audit log operations

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::to_unix;

/// Audit log row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditRow {
    pub id: i64,
    pub created_at: i64,
    pub event_type: String,
    pub fingerprint: String,
    pub details: Option<String>,
    pub status: String,
}

/// Audit log repository
pub struct AuditRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> AuditRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an event
    pub async fn insert(
        &self,
        created_at: DateTime<Utc>,
        event_type: &str,
        fingerprint: &str,
        details: Option<&str>,
        status: &str,
    ) -> sqlx::Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_log (created_at, event_type, fingerprint, details, status)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(to_unix(created_at))
        .bind(event_type)
        .bind(fingerprint)
        .bind(details)
        .bind(status)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent events first
    pub async fn list_recent(&self, limit: i64) -> sqlx::Result<Vec<AuditRow>> {
        sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, created_at, event_type, fingerprint, details, status
            FROM audit_log
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await
    }

    /// Delete events older than `cutoff`
    pub async fn delete_before(&self, cutoff: DateTime<Utc>) -> sqlx::Result<u64> {
        let result = sqlx::query("DELETE FROM audit_log WHERE created_at < ?")
            .bind(to_unix(cutoff))
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
