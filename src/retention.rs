//! Retention Sweeper
//!
//! Periodically removes abandoned chunks, expired artifacts, old audit rows
//! and stray in-flight files. The filesystem entity goes first; a row is
//! only deleted once its file is gone, so a failed delete is retried on the
//! next pass. Sweeping twice in a row deletes nothing the second time.

use std::future::Future;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::RetentionConfig;
use crate::db::{ArtifactRepository, AuditRepository, ChunkRepository};
use crate::upload::{remove_if_present, MergeTracker, SessionState, UploadPaths};

/// What one pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub chunks_removed: usize,
    pub artifacts_removed: usize,
    pub audit_rows_removed: u64,
    pub stray_files_removed: usize,
    pub sessions_pruned: usize,
    /// Entities kept because their removal failed
    pub errors: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.chunks_removed == 0
            && self.artifacts_removed == 0
            && self.audit_rows_removed == 0
            && self.stray_files_removed == 0
            && self.sessions_pruned == 0
    }
}

#[derive(Clone)]
pub struct RetentionSweeper {
    pool: SqlitePool,
    paths: UploadPaths,
    retention: RetentionConfig,
    tracker: MergeTracker,
}

impl RetentionSweeper {
    pub fn new(
        pool: SqlitePool,
        paths: UploadPaths,
        retention: RetentionConfig,
        tracker: MergeTracker,
    ) -> Self {
        Self {
            pool,
            paths,
            retention,
            tracker,
        }
    }

    /// Run one full pass as of `now`
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        if let Err(e) = self.sweep_chunks(now, &mut report).await {
            tracing::error!(error = %e, "Chunk sweep failed");
            report.errors += 1;
        }
        if let Err(e) = self.sweep_artifacts(now, &mut report).await {
            tracing::error!(error = %e, "Artifact sweep failed");
            report.errors += 1;
        }
        if let Err(e) = self.sweep_audit_log(now, &mut report).await {
            tracing::error!(error = %e, "Audit log sweep failed");
            report.errors += 1;
        }
        if let Err(e) = self.sweep_stray_files(now, &mut report).await {
            tracing::error!(error = %e, "Stray file sweep failed");
            report.errors += 1;
        }

        report.sessions_pruned = self.tracker.prune(now - self.retention.orphan_chunk_age());
        report
    }

    /// Chunks older than the orphan age, unless their session is merging
    async fn sweep_chunks(&self, now: DateTime<Utc>, report: &mut SweepReport) -> sqlx::Result<()> {
        let repo = ChunkRepository::new(&self.pool);
        let cutoff = now - self.retention.orphan_chunk_age();

        for row in repo.list_received_before(cutoff).await? {
            if self.tracker.state(&row.session_id) == SessionState::Merging {
                continue;
            }

            // A retried chunk reuses the blob name; the fresh row owns the file
            if repo.blob_referenced_since(&row.blob_name, cutoff).await? {
                if repo.delete(row.id).await? {
                    report.chunks_removed += 1;
                }
                continue;
            }

            match remove_if_present(&self.paths.chunk_path(&row.blob_name)).await {
                Ok(_) => {
                    if repo.delete(row.id).await? {
                        report.chunks_removed += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(blob = %row.blob_name, error = %e, "Failed to delete orphan chunk");
                    report.errors += 1;
                }
            }
        }

        Ok(())
    }

    /// Artifacts past the file retention window
    async fn sweep_artifacts(&self, now: DateTime<Utc>, report: &mut SweepReport) -> sqlx::Result<()> {
        let Some(retention) = self.retention.file_retention() else {
            return Ok(());
        };
        let repo = ArtifactRepository::new(&self.pool);

        for row in repo.list_created_before(now - retention).await? {
            match remove_if_present(&self.paths.artifact_path(&row.public_id)).await {
                Ok(_) => {
                    if repo.delete(row.id).await? {
                        tracing::info!(public_id = %row.public_id, "Expired artifact removed");
                        report.artifacts_removed += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(public_id = %row.public_id, error = %e, "Failed to delete expired artifact");
                    report.errors += 1;
                }
            }
        }

        Ok(())
    }

    async fn sweep_audit_log(&self, now: DateTime<Utc>, report: &mut SweepReport) -> sqlx::Result<()> {
        if let Some(retention) = self.retention.audit_log_retention() {
            report.audit_rows_removed = AuditRepository::new(&self.pool)
                .delete_before(now - retention)
                .await?;
        }
        Ok(())
    }

    /// Staging files of crashed merges and temp files of interrupted chunk writes
    async fn sweep_stray_files(&self, now: DateTime<Utc>, report: &mut SweepReport) -> io::Result<()> {
        let cutoff = SystemTime::from(now - self.retention.orphan_chunk_age());

        report.stray_files_removed += remove_stale(&self.paths.staging_dir(), cutoff, |_| true).await?;
        report.stray_files_removed += remove_stale(&self.paths.pending_dir(), cutoff, |name| {
            name.ends_with(".tmp")
        })
        .await?;

        Ok(())
    }

    /// Run a pass immediately, then every interval, until `shutdown` resolves
    pub fn start<F>(self, shutdown: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.retention.sweep_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tokio::pin!(shutdown);

            loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        tracing::info!("Retention sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let report = self.sweep(Utc::now()).await;
                        if !report.is_empty() || report.errors > 0 {
                            tracing::info!(
                                chunks = report.chunks_removed,
                                artifacts = report.artifacts_removed,
                                audit_rows = report.audit_rows_removed,
                                stray_files = report.stray_files_removed,
                                sessions = report.sessions_pruned,
                                errors = report.errors,
                                "Retention sweep complete"
                            );
                        }
                    }
                }
            }
        })
    }
}

/// Remove files in `dir` last modified before `cutoff`
async fn remove_stale<P>(dir: &Path, cutoff: SystemTime, wanted: P) -> io::Result<usize>
where
    P: Fn(&str) -> bool,
{
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !wanted(&name.to_string_lossy()) {
            continue;
        }

        let metadata = entry.metadata().await?;
        if !metadata.is_file() || metadata.modified()? >= cutoff {
            continue;
        }

        match remove_if_present(&entry.path()).await {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!(path = %entry.path().display(), error = %e, "Failed to delete stray file"),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{create_pool_at, insert_artifact};
    use crate::upload::{ArtifactRecord, ChunkCipher, ChunkStore, Fingerprint};
    use chrono::Duration;
    use tempfile::TempDir;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    struct Fixture {
        _dir: TempDir,
        pool: SqlitePool,
        paths: UploadPaths,
        tracker: MergeTracker,
        sweeper: RetentionSweeper,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let pool = create_pool_at(&dir.path().join("sweep.db")).await.unwrap();
        let paths = UploadPaths::new(dir.path().join("uploads"));
        paths.ensure().await.unwrap();
        let tracker = MergeTracker::new();
        let sweeper = RetentionSweeper::new(
            pool.clone(),
            paths.clone(),
            Config::default().retention,
            tracker.clone(),
        );
        Fixture {
            _dir: dir,
            pool,
            paths,
            tracker,
            sweeper,
        }
    }

    async fn publish(f: &Fixture, id: &str, at: DateTime<Utc>) {
        let record = ArtifactRecord {
            public_id: id.to_string(),
            original_name: "a.txt".to_string(),
            size_bytes: 3,
            created_at: at,
            owner_fingerprint: Fingerprint::from_stored("owner"),
            collection_id: None,
            content_checksum: None,
        };
        insert_artifact(&f.pool, &record).await.unwrap();
        tokio::fs::write(f.paths.artifact_path(id), b"abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let f = fixture().await;
        let store = ChunkStore::new(
            f.pool.clone(),
            f.paths.clone(),
            ChunkCipher::derive(SECRET, 1_000),
            SECRET,
        );
        let owner = Fingerprint::from_stored("owner");
        store.put_chunk("s1", 0, b"one", &owner).await.unwrap();
        store.put_chunk("s1", 1, b"two", &owner).await.unwrap();
        publish(&f, "old1", Utc::now() - Duration::days(31)).await;
        publish(&f, "new1", Utc::now()).await;

        let later = Utc::now() + Duration::hours(25);
        let first = f.sweeper.sweep(later).await;
        assert_eq!(first.chunks_removed, 2);
        assert_eq!(first.artifacts_removed, 1);
        assert_eq!(first.errors, 0);
        assert!(!f.paths.artifact_path("old1").exists());
        assert!(f.paths.artifact_path("new1").exists());
        assert!(store.list_chunks("s1").await.unwrap().is_empty());

        let second = f.sweeper.sweep(later).await;
        assert!(second.is_empty(), "second pass removed {second:?}");
    }

    #[tokio::test]
    async fn test_fresh_chunks_survive() {
        let f = fixture().await;
        let store = ChunkStore::new(
            f.pool.clone(),
            f.paths.clone(),
            ChunkCipher::derive(SECRET, 1_000),
            SECRET,
        );
        store
            .put_chunk("s1", 0, b"one", &Fingerprint::from_stored("owner"))
            .await
            .unwrap();

        let report = f.sweeper.sweep(Utc::now()).await;
        assert_eq!(report.chunks_removed, 0);
        assert_eq!(store.list_chunks("s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retried_chunk_keeps_shared_blob() {
        let f = fixture().await;
        let store = ChunkStore::new(
            f.pool.clone(),
            f.paths.clone(),
            ChunkCipher::derive(SECRET, 1_000),
            SECRET,
        );
        let owner = Fingerprint::from_stored("owner");
        store.put_chunk("s1", 0, b"first try", &owner).await.unwrap();

        // Age the first attempt past the orphan window
        sqlx::query("UPDATE uploaded_chunks SET received_at = received_at - ?")
            .bind(30 * 3600_i64)
            .execute(&f.pool)
            .await
            .unwrap();
        store.put_chunk("s1", 0, b"retry", &owner).await.unwrap();

        let report = f.sweeper.sweep(Utc::now()).await;
        assert_eq!(report.chunks_removed, 1);
        assert_eq!(report.errors, 0);

        let remaining = store.list_chunks("s1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(store.read_chunk(&remaining[0]).await.unwrap(), b"retry");
    }

    #[tokio::test]
    async fn test_merging_session_chunks_survive() {
        let f = fixture().await;
        let store = ChunkStore::new(
            f.pool.clone(),
            f.paths.clone(),
            ChunkCipher::derive(SECRET, 1_000),
            SECRET,
        );
        store
            .put_chunk("s1", 0, b"one", &Fingerprint::from_stored("owner"))
            .await
            .unwrap();
        let _guard = f.tracker.begin_merge("s1").unwrap();

        let report = f.sweeper.sweep(Utc::now() + Duration::hours(25)).await;
        assert_eq!(report.chunks_removed, 0);
    }

    #[tokio::test]
    async fn test_missing_artifact_file_still_clears_row() {
        let f = fixture().await;
        publish(&f, "gone", Utc::now() - Duration::days(31)).await;
        tokio::fs::remove_file(f.paths.artifact_path("gone")).await.unwrap();

        let report = f.sweeper.sweep(Utc::now()).await;
        assert_eq!(report.artifacts_removed, 1);
        assert!(ArtifactRepository::new(&f.pool).get("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_staging_files_removed() {
        let f = fixture().await;
        let staging = f.paths.staging_path("s1");
        tokio::fs::write(&staging, b"partial").await.unwrap();

        // Fresh file stays
        assert_eq!(f.sweeper.sweep(Utc::now()).await.stray_files_removed, 0);

        let report = f.sweeper.sweep(Utc::now() + Duration::hours(25)).await;
        assert_eq!(report.stray_files_removed, 1);
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn test_start_stops_on_shutdown() {
        let f = fixture().await;
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = f.sweeper.clone().start(async move {
            let _ = rx.await;
        });

        tx.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
