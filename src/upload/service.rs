//! Upload Service
//!
//! Entry points used by the transport layer. Wires the chunk store, quota
//! tracker, merge pipeline and audit log together and applies time budgets.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;

use super::audit::{AuditEvent, AuditLog};
use super::chunk_store::ChunkStore;
use super::crypto::{ChunkCipher, Fingerprint};
use super::identifier::IdAllocator;
use super::merge::{MergePipeline, MergePolicy};
use super::paths::UploadPaths;
use super::quota::QuotaTracker;
use super::session::MergeTracker;
use super::types::{
    ArtifactRecord, ArtifactSummary, ChunkReceipt, MergeRequest, QuotaUsage, SessionState,
    UploadError,
};
use super::validate;
use crate::config::Config;
use crate::db::ArtifactRepository;
use crate::retention::RetentionSweeper;

#[derive(Clone)]
pub struct UploadService {
    inner: Arc<UploadServiceInner>,
}

struct UploadServiceInner {
    config: Config,
    pool: SqlitePool,
    paths: UploadPaths,
    store: ChunkStore,
    quota: QuotaTracker,
    audit: AuditLog,
    pipeline: MergePipeline,
}

impl UploadService {
    /// Build the service and create the upload directory tree.
    ///
    /// Derives the chunk key, which is deliberately slow.
    pub async fn new(config: Config, pool: SqlitePool) -> Result<Self, UploadError> {
        let paths = UploadPaths::new(&config.storage.upload_dir);
        paths.ensure().await?;

        let secret = config.server.secret.clone();
        let iterations = config.crypto.kdf_iterations;
        let cipher = tokio::task::spawn_blocking(move || ChunkCipher::derive(&secret, iterations))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        let store = ChunkStore::new(pool.clone(), paths.clone(), cipher, &config.server.secret);
        let quota = QuotaTracker::new(pool.clone(), config.limits.clone());
        let audit = AuditLog::new(pool.clone());
        let pipeline = MergePipeline::new(
            store.clone(),
            quota.clone(),
            IdAllocator::from_config(&config),
            audit.clone(),
            MergeTracker::new(),
            MergePolicy::from_config(&config),
        );

        tracing::info!(
            upload_dir = %paths.root().display(),
            id_mode = ?config.ids.mode,
            quotas = config.limits.any_quota(),
            "Upload service ready"
        );

        Ok(Self {
            inner: Arc::new(UploadServiceInner {
                config,
                pool,
                paths,
                store,
                quota,
                audit,
                pipeline,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Fingerprint an uploader's network address
    pub fn fingerprint(&self, address: Option<&str>) -> Fingerprint {
        Fingerprint::from_address(address, &self.inner.config.server.secret)
    }

    /// Store one chunk. Quotas are checked when the first chunk arrives.
    pub async fn put_chunk(
        &self,
        session_id: &str,
        index: u32,
        data: &[u8],
        owner: &Fingerprint,
    ) -> Result<ChunkReceipt, UploadError> {
        validate::session_id(session_id)?;

        with_timeout(self.inner.config.timeouts.chunk_timeout(), async {
            if index == 0 {
                if let Err(e) = self.inner.quota.check_quotas(owner, Utc::now()).await {
                    if let UploadError::QuotaExceeded { kind, used, limit, .. } = &e {
                        self.inner
                            .audit
                            .record(
                                AuditEvent::QuotaExceeded,
                                owner,
                                json!({ "uuid": session_id, "quota": kind, "used": used, "limit": limit }),
                            )
                            .await;
                    }
                    return Err(e);
                }
            }

            self.inner.store.put_chunk(session_id, index, data, owner).await
        })
        .await
    }

    /// Assemble and publish a session's chunks
    pub async fn merge(&self, request: MergeRequest) -> Result<ArtifactRecord, UploadError> {
        with_timeout(
            self.inner.config.timeouts.merge_timeout(),
            self.inner.pipeline.merge(request),
        )
        .await
    }

    /// Metadata for one artifact
    pub async fn lookup_artifact(&self, public_id: &str) -> Result<ArtifactSummary, UploadError> {
        validate::public_id(public_id)?;

        let row = ArtifactRepository::new(&self.inner.pool)
            .get(public_id)
            .await?
            .ok_or_else(|| UploadError::NotFound(public_id.to_string()))?;

        Ok(ArtifactSummary::from(&ArtifactRecord::from(row)))
    }

    /// Where a published artifact's bytes live
    pub fn artifact_path(&self, public_id: &str) -> Result<PathBuf, UploadError> {
        validate::public_id(public_id)?;
        Ok(self.inner.paths.artifact_path(public_id))
    }

    /// Members of a collection in upload order
    pub async fn list_collection(&self, collection_id: &str) -> Result<Vec<ArtifactSummary>, UploadError> {
        validate::collection_id(collection_id)?;

        let records: Vec<ArtifactRecord> = ArtifactRepository::new(&self.inner.pool)
            .list_collection(collection_id)
            .await?
            .into_iter()
            .map(ArtifactRecord::from)
            .collect();

        let Some(oldest) = records.iter().map(|r| r.created_at).min() else {
            return Err(UploadError::NotFound(collection_id.to_string()));
        };

        if let Some(expiration) = self.inner.config.retention.collection_expiration() {
            if Utc::now() - oldest > expiration {
                tracing::info!(collection_id = %collection_id, "Collection expired");
                return Err(UploadError::Expired(collection_id.to_string()));
            }
        }

        Ok(records.iter().map(ArtifactSummary::from).collect())
    }

    /// Quota usage snapshot for an uploader
    pub async fn current_quota_usage(&self, owner: &Fingerprint) -> Result<QuotaUsage, UploadError> {
        self.inner.quota.current_usage(owner, Utc::now()).await
    }

    pub fn session_state(&self, session_id: &str) -> SessionState {
        self.inner.pipeline.tracker().state(session_id)
    }

    /// Sweeper over this service's ledger and upload directory
    pub fn sweeper(&self) -> RetentionSweeper {
        RetentionSweeper::new(
            self.inner.pool.clone(),
            self.inner.paths.clone(),
            self.inner.config.retention.clone(),
            self.inner.pipeline.tracker().clone(),
        )
    }
}

/// Zero disables the budget
async fn with_timeout<T, F>(limit: Duration, future: F) -> Result<T, UploadError>
where
    F: Future<Output = Result<T, UploadError>>,
{
    if limit.is_zero() {
        return future.await;
    }
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| UploadError::Timeout(limit.as_secs()))?
}
