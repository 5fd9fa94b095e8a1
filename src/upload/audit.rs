//! Structured audit events
//!
//! Audit writes are best-effort: a failed write is logged and never fails
//! the upload it describes.

use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;

use super::crypto::Fingerprint;
use crate::db::AuditRepository;

/// Audit event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    QuotaExceeded,
    Blocked,
    Rejected,
    Success,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuotaExceeded => "UPLOAD_QUOTA_EXCEEDED",
            Self::Blocked => "UPLOAD_BLOCKED",
            Self::Rejected => "UPLOAD_REJECTED",
            Self::Success => "UPLOAD_SUCCESS",
        }
    }

    /// Outcome recorded alongside the event
    pub fn status(&self) -> AuditStatus {
        match self {
            Self::QuotaExceeded | Self::Rejected => AuditStatus::Failure,
            Self::Blocked => AuditStatus::Blocked,
            Self::Success => AuditStatus::Success,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    Success,
    Failure,
    Blocked,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Blocked => "BLOCKED",
        }
    }
}

/// Audit sink backed by the `audit_log` table
#[derive(Clone)]
pub struct AuditLog {
    pool: SqlitePool,
}

impl AuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record an event
    pub async fn record(&self, event: AuditEvent, owner: &Fingerprint, details: Value) {
        let details = details.to_string();
        let result = AuditRepository::new(&self.pool)
            .insert(
                Utc::now(),
                event.as_str(),
                owner.as_str(),
                Some(details.as_str()),
                event.status().as_str(),
            )
            .await;

        if let Err(e) = result {
            tracing::error!(
                event = event.as_str(),
                fingerprint = %owner.short(),
                error = %e,
                "Failed to write audit event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool_at;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_record_event() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool_at(&dir.path().join("audit.db")).await.unwrap();
        let audit = AuditLog::new(pool.clone());
        let owner = Fingerprint::from_stored("f".repeat(64));

        audit
            .record(AuditEvent::Blocked, &owner, json!({ "mime": "application/x-sh" }))
            .await;

        let rows = AuditRepository::new(&pool).list_recent(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "UPLOAD_BLOCKED");
        assert_eq!(rows[0].status, "BLOCKED");
        assert!(rows[0].details.as_deref().unwrap().contains("application/x-sh"));
    }

    #[tokio::test]
    async fn test_write_failure_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool_at(&dir.path().join("audit.db")).await.unwrap();
        let audit = AuditLog::new(pool.clone());
        pool.close().await;

        // Must not panic or propagate
        audit
            .record(
                AuditEvent::Success,
                &Fingerprint::from_stored("unknown"),
                json!({}),
            )
            .await;
    }
}
