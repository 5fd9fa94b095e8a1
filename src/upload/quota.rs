//! Quota Tracker
//!
//! Read-only aggregation over the artifact ledger. Usage is always
//! recomputed, never cached.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use super::crypto::Fingerprint;
use super::types::{
    QuotaKind, QuotaUsage, UploadError, UploaderUsage, UsageLine, QUOTA_RETRY_AFTER_SECS,
    QUOTA_WINDOW_SECS,
};
use crate::config::LimitsConfig;
use crate::db::ArtifactRepository;

#[derive(Clone)]
pub struct QuotaTracker {
    pool: SqlitePool,
    limits: LimitsConfig,
}

impl QuotaTracker {
    pub fn new(pool: SqlitePool, limits: LimitsConfig) -> Self {
        Self { pool, limits }
    }

    /// Pre-admission check for a new upload.
    ///
    /// Admission is not a reservation: concurrent uploads can each pass and
    /// together exceed a limit. The merge re-checks global storage.
    pub async fn check_quotas(&self, owner: &Fingerprint, now: DateTime<Utc>) -> Result<(), UploadError> {
        let usage = self.usage(owner, now).await?;

        let checks = [
            (QuotaKind::GlobalStorage, usage.global),
            (QuotaKind::DailyBytes, usage.per_uploader.bytes),
            (QuotaKind::DailyFiles, usage.per_uploader.files),
        ];

        for (kind, line) in checks {
            if let Some(UsageLine { used, limit }) = line {
                if used >= limit {
                    tracing::warn!(
                        fingerprint = %owner.short(),
                        quota = %kind,
                        used,
                        limit,
                        "Quota exceeded"
                    );
                    return Err(UploadError::QuotaExceeded {
                        kind,
                        used,
                        limit,
                        retry_after_secs: QUOTA_RETRY_AFTER_SECS,
                    });
                }
            }
        }

        Ok(())
    }

    /// Reject an artifact whose size would push global storage past the limit
    pub async fn check_global_with(&self, additional_bytes: u64) -> Result<(), UploadError> {
        let Some(limit) = self.limits.max_storage_bytes() else {
            return Ok(());
        };

        let used = ArtifactRepository::new(&self.pool).total_bytes().await?;
        if used.saturating_add(additional_bytes) > limit {
            tracing::warn!(used, additional_bytes, limit, "Artifact would exceed storage quota");
            return Err(UploadError::QuotaExceeded {
                kind: QuotaKind::GlobalStorage,
                used,
                limit,
                retry_after_secs: QUOTA_RETRY_AFTER_SECS,
            });
        }
        Ok(())
    }

    /// Usage snapshot for display
    pub async fn current_usage(&self, owner: &Fingerprint, now: DateTime<Utc>) -> Result<QuotaUsage, UploadError> {
        if !self.limits.any_quota() {
            return Ok(QuotaUsage::default());
        }
        self.usage(owner, now).await
    }

    async fn usage(&self, owner: &Fingerprint, now: DateTime<Utc>) -> Result<QuotaUsage, UploadError> {
        let repo = ArtifactRepository::new(&self.pool);
        let since = now - Duration::seconds(QUOTA_WINDOW_SECS);

        let global = async {
            match self.limits.max_storage_bytes() {
                Some(limit) => Ok::<_, sqlx::Error>(Some(UsageLine {
                    used: repo.total_bytes().await?,
                    limit,
                })),
                None => Ok(None),
            }
        };
        let bytes = async {
            match self.limits.per_uploader_daily_bytes() {
                Some(limit) => Ok::<_, sqlx::Error>(Some(UsageLine {
                    used: repo.bytes_since(owner, since).await?,
                    limit,
                })),
                None => Ok(None),
            }
        };
        let files = async {
            match self.limits.per_uploader_daily_files() {
                Some(limit) => Ok::<_, sqlx::Error>(Some(UsageLine {
                    used: repo.count_since(owner, since).await?,
                    limit,
                })),
                None => Ok(None),
            }
        };

        let (global, bytes, files) = tokio::try_join!(global, bytes, files)?;

        Ok(QuotaUsage {
            enabled: self.limits.any_quota(),
            global,
            per_uploader: UploaderUsage { bytes, files },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{create_pool_at, insert_artifact};
    use crate::upload::ArtifactRecord;
    use tempfile::TempDir;

    fn limits(global: i64, daily_bytes: i64, daily_files: i64) -> LimitsConfig {
        let mut limits = Config::default().limits;
        limits.max_storage_bytes = global;
        limits.per_uploader_daily_bytes = daily_bytes;
        limits.per_uploader_daily_files = daily_files;
        limits
    }

    async fn publish(pool: &SqlitePool, id: &str, owner: &Fingerprint, size: u64, at: DateTime<Utc>) {
        let record = ArtifactRecord {
            public_id: id.to_string(),
            original_name: "file.bin".to_string(),
            size_bytes: size,
            created_at: at,
            owner_fingerprint: owner.clone(),
            collection_id: None,
            content_checksum: None,
        };
        insert_artifact(pool, &record).await.unwrap();
    }

    #[tokio::test]
    async fn test_global_quota_boundary() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool_at(&dir.path().join("q.db")).await.unwrap();
        let owner = Fingerprint::from_stored("owner");
        let now = Utc::now();
        let tracker = QuotaTracker::new(pool.clone(), limits(1000, 0, 0));

        publish(&pool, "aaaa", &owner, 999, now).await;
        assert!(tracker.check_quotas(&owner, now).await.is_ok());

        publish(&pool, "bbbb", &owner, 1, now).await;
        let err = tracker.check_quotas(&owner, now).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::QuotaExceeded {
                kind: QuotaKind::GlobalStorage,
                used: 1000,
                limit: 1000,
                retry_after_secs: 86400,
            }
        ));
    }

    #[tokio::test]
    async fn test_daily_window_is_trailing() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool_at(&dir.path().join("q.db")).await.unwrap();
        let owner = Fingerprint::from_stored("owner");
        let other = Fingerprint::from_stored("other");
        let now = Utc::now();
        let tracker = QuotaTracker::new(pool.clone(), limits(0, 0, 2));

        // Outside the window, and another uploader: neither counts
        publish(&pool, "old1", &owner, 10, now - Duration::hours(25)).await;
        publish(&pool, "oth1", &other, 10, now).await;
        publish(&pool, "new1", &owner, 10, now).await;
        assert!(tracker.check_quotas(&owner, now).await.is_ok());

        publish(&pool, "new2", &owner, 10, now).await;
        let err = tracker.check_quotas(&owner, now).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::QuotaExceeded {
                kind: QuotaKind::DailyFiles,
                used: 2,
                ..
            }
        ));
        assert_eq!(err.status_code(), axum::http::StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_merge_time_tightening() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool_at(&dir.path().join("q.db")).await.unwrap();
        let owner = Fingerprint::from_stored("owner");
        let tracker = QuotaTracker::new(pool.clone(), limits(1000, 0, 0));

        publish(&pool, "aaaa", &owner, 600, Utc::now()).await;
        assert!(tracker.check_global_with(400).await.is_ok());
        assert!(tracker.check_global_with(401).await.is_err());
    }

    #[tokio::test]
    async fn test_usage_snapshot() {
        let dir = TempDir::new().unwrap();
        let pool = create_pool_at(&dir.path().join("q.db")).await.unwrap();
        let owner = Fingerprint::from_stored("owner");
        let now = Utc::now();

        let disabled = QuotaTracker::new(pool.clone(), limits(0, 0, 0));
        assert_eq!(disabled.current_usage(&owner, now).await.unwrap(), QuotaUsage::default());

        publish(&pool, "aaaa", &owner, 300, now).await;
        let tracker = QuotaTracker::new(pool.clone(), limits(1000, 500, 0));
        let usage = tracker.current_usage(&owner, now).await.unwrap();

        assert!(usage.enabled);
        assert_eq!(usage.global, Some(UsageLine { used: 300, limit: 1000 }));
        assert_eq!(usage.per_uploader.bytes, Some(UsageLine { used: 300, limit: 500 }));
        assert_eq!(usage.per_uploader.files, None);
    }
}
