//! Merge Pipeline
//!
//! Turns a session's chunks into one published artifact:
//!
//! 1. Select the newest chunk per index; the index set must be `0..declared`
//! 2. Decrypt and concatenate into a staging file, hashing as we go
//! 3. Size, checksum, content-type and storage policy
//! 4. Publish: ledger insert + chunk row delete + rename, in one transaction
//!
//! Chunk blobs are only deleted after the ledger commit. Policy rejections
//! delete everything; storage failures keep the chunks for a retry.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use super::audit::{AuditEvent, AuditLog};
use super::chunk_store::ChunkStore;
use super::identifier::{HashSeed, IdAllocator};
use super::paths::remove_if_present;
use super::quota::QuotaTracker;
use super::session::MergeTracker;
use super::sniff::{is_blocked, sniff_mime};
use super::types::{
    ArtifactRecord, ChunkRef, ErrorClass, MergeRequest, SessionState, UploadError, SNIFF_WINDOW,
};
use crate::config::Config;
use crate::db::{delete_chunk_rows, insert_artifact};

/// Index lists in `IncompleteUpload` are truncated to this many entries
const MAX_REPORTED_INDICES: usize = 64;

/// Content policy applied to assembled artifacts
#[derive(Debug, Clone)]
pub struct MergePolicy {
    pub max_file_size: Option<u64>,
    pub blocked_mime_types: Vec<String>,
}

impl MergePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_file_size: config.limits.max_file_size_bytes(),
            blocked_mime_types: config.policy.blocked_mime_types.clone(),
        }
    }
}

/// Result of concatenating chunks into the staging file
#[derive(Debug)]
struct Assembled {
    size: u64,
    checksum: String,
    head: Vec<u8>,
}

/// Assembles and publishes artifacts
#[derive(Clone)]
pub struct MergePipeline {
    store: ChunkStore,
    quota: QuotaTracker,
    ids: IdAllocator,
    audit: AuditLog,
    tracker: MergeTracker,
    policy: Arc<MergePolicy>,
}

impl MergePipeline {
    pub fn new(
        store: ChunkStore,
        quota: QuotaTracker,
        ids: IdAllocator,
        audit: AuditLog,
        tracker: MergeTracker,
        policy: MergePolicy,
    ) -> Self {
        Self {
            store,
            quota,
            ids,
            audit,
            tracker,
            policy: Arc::new(policy),
        }
    }

    pub fn tracker(&self) -> &MergeTracker {
        &self.tracker
    }

    /// Merge a session's chunks into a published artifact
    pub async fn merge(&self, request: MergeRequest) -> Result<ArtifactRecord, UploadError> {
        let request = request.validate()?;
        let guard = self.tracker.begin_merge(&request.session_id)?;

        tracing::info!(
            session_id = %request.session_id,
            chunks = request.declared_chunk_count,
            has_checksum = request.checksum.is_some(),
            "Merge requested"
        );

        match self.run(&request).await {
            Ok(record) => {
                guard.finish(SessionState::Published);
                Ok(record)
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %request.session_id,
                    code = e.code(),
                    error = %e,
                    "Merge failed"
                );
                guard.finish(SessionState::Failed);
                Err(e)
            }
        }
    }

    async fn run(&self, request: &MergeRequest) -> Result<ArtifactRecord, UploadError> {
        let rows = self.store.list_chunks(&request.session_id).await?;
        let ordered = select_chunks(&rows, request.declared_chunk_count)?;

        let staging_path = self.store.paths().staging_path(&request.session_id);
        let assembled = match self.assemble(&ordered, &staging_path).await {
            Ok(assembled) => assembled,
            Err(e) => {
                discard_file(&staging_path).await;
                return Err(e);
            }
        };

        if let Err(e) = self.enforce_policy(request, &assembled).await {
            discard_file(&staging_path).await;
            if e.class() == ErrorClass::Policy {
                // Rejected content is not kept around for a retry
                if let Err(cleanup) = self.store.delete_chunks(&rows).await {
                    tracing::warn!(error = %cleanup, "Failed to delete rejected chunks");
                }
            }
            return Err(e);
        }

        // Publish runs to completion even if the caller stops waiting,
        // so a timeout can never split the rename from the commit.
        let pipeline = self.clone();
        let request = request.clone();
        let publish_staging = staging_path.clone();
        let handle = tokio::spawn(async move {
            pipeline
                .publish(&request, &rows, &publish_staging, assembled)
                .await
        });

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e).into()),
        };
        if result.is_err() {
            discard_file(&staging_path).await;
        }
        result
    }

    /// Decrypt chunks in order into the staging file
    async fn assemble(&self, ordered: &[ChunkRef], staging_path: &Path) -> Result<Assembled, UploadError> {
        let mut file = tokio::fs::File::create(staging_path).await?;
        let mut hasher = Sha256::new();
        let mut head = Vec::with_capacity(SNIFF_WINDOW);
        let mut size: u64 = 0;

        for chunk in ordered {
            let data = self.store.read_chunk(chunk).await?;

            hasher.update(&data);
            if head.len() < SNIFF_WINDOW {
                let take = (SNIFF_WINDOW - head.len()).min(data.len());
                head.extend_from_slice(&data[..take]);
            }
            file.write_all(&data).await?;
            size += data.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;

        Ok(Assembled {
            size,
            checksum: hex::encode(hasher.finalize()),
            head,
        })
    }

    /// Size, integrity, type and storage checks, in that order
    async fn enforce_policy(&self, request: &MergeRequest, assembled: &Assembled) -> Result<(), UploadError> {
        if let Some(limit) = self.policy.max_file_size {
            if assembled.size > limit {
                self.audit
                    .record(
                        AuditEvent::Rejected,
                        &request.owner,
                        json!({ "uuid": request.session_id, "reason": "size", "size": assembled.size, "limit": limit }),
                    )
                    .await;
                return Err(UploadError::ArtifactTooLarge {
                    limit,
                    actual: assembled.size,
                });
            }
        }

        if let Some(expected) = &request.checksum {
            if *expected != assembled.checksum {
                self.audit
                    .record(
                        AuditEvent::Rejected,
                        &request.owner,
                        json!({ "uuid": request.session_id, "reason": "checksum" }),
                    )
                    .await;
                return Err(UploadError::IntegrityMismatch {
                    expected: expected.clone(),
                    actual: assembled.checksum.clone(),
                });
            }
        }

        match sniff_mime(&assembled.head) {
            Some(mime) if is_blocked(mime, &self.policy.blocked_mime_types) => {
                tracing::warn!(
                    session_id = %request.session_id,
                    mime,
                    fingerprint = %request.owner.short(),
                    "Blocked file type"
                );
                self.audit
                    .record(
                        AuditEvent::Blocked,
                        &request.owner,
                        json!({ "uuid": request.session_id, "mime": mime }),
                    )
                    .await;
                return Err(UploadError::TypeBlocked {
                    mime: mime.to_string(),
                });
            }
            Some(mime) => {
                tracing::debug!(session_id = %request.session_id, mime, "Detected file type");
            }
            None => {
                tracing::info!(session_id = %request.session_id, "File type not detected, allowing");
            }
        }

        if let Err(e) = self.quota.check_global_with(assembled.size).await {
            if let UploadError::QuotaExceeded { used, limit, .. } = &e {
                self.audit
                    .record(
                        AuditEvent::QuotaExceeded,
                        &request.owner,
                        json!({ "uuid": request.session_id, "used": used, "limit": limit, "size": assembled.size }),
                    )
                    .await;
            }
            return Err(e);
        }

        Ok(())
    }

    /// Allocate an id and make the artifact visible atomically
    async fn publish(
        &self,
        request: &MergeRequest,
        rows: &[ChunkRef],
        staging_path: &Path,
        assembled: Assembled,
    ) -> Result<ArtifactRecord, UploadError> {
        let now = Utc::now();
        let pool = self.store.pool();

        let reservation = self
            .ids
            .allocate(
                pool,
                HashSeed {
                    original_name: &request.original_name,
                    owner: &request.owner,
                    at: now,
                },
            )
            .await?;

        let record = ArtifactRecord {
            public_id: reservation.id().to_string(),
            original_name: request.original_name.clone(),
            size_bytes: assembled.size,
            created_at: now,
            owner_fingerprint: request.owner.clone(),
            collection_id: request.collection_id.clone(),
            content_checksum: Some(assembled.checksum),
        };
        let final_path = self.store.paths().artifact_path(&record.public_id);

        // A file without a ledger row still owns its name
        if tokio::fs::try_exists(&final_path).await? {
            return Err(UploadError::DuplicateIdentifier(record.public_id));
        }

        let mut tx = pool.begin().await?;
        insert_artifact(&mut *tx, &record).await.map_err(|e| {
            if is_unique_violation(&e) {
                UploadError::DuplicateIdentifier(record.public_id.clone())
            } else {
                UploadError::Database(e)
            }
        })?;

        let ids: Vec<i64> = rows.iter().map(|c| c.id).collect();
        delete_chunk_rows(&mut *tx, &ids).await?;

        // Dropping `tx` on error rolls back
        tokio::fs::rename(staging_path, &final_path).await?;

        if let Err(e) = tx.commit().await {
            // We performed the rename, so the file is ours to remove
            discard_file(&final_path).await;
            return Err(e.into());
        }
        drop(reservation);

        let removed = self.store.delete_chunk_files(rows).await;

        tracing::info!(
            session_id = %request.session_id,
            public_id = %record.public_id,
            size = record.size_bytes,
            chunks = removed,
            fingerprint = %request.owner.short(),
            "Artifact published"
        );
        self.audit
            .record(
                AuditEvent::Success,
                &request.owner,
                json!({
                    "uuid": request.session_id,
                    "publicId": record.public_id,
                    "size": record.size_bytes,
                    "collectionId": record.collection_id,
                }),
            )
            .await;

        Ok(record)
    }
}

/// Pick the newest row per index and require exactly `0..declared`.
///
/// `rows` must be ordered by index then arrival.
pub fn select_chunks(rows: &[ChunkRef], declared: u32) -> Result<Vec<ChunkRef>, UploadError> {
    let mut latest: BTreeMap<u32, &ChunkRef> = BTreeMap::new();
    for row in rows {
        latest.insert(row.index, row);
    }

    let missing: Vec<u32> = (0..declared)
        .filter(|i| !latest.contains_key(i))
        .take(MAX_REPORTED_INDICES)
        .collect();
    let unexpected: Vec<u32> = latest
        .keys()
        .copied()
        .filter(|i| *i >= declared)
        .take(MAX_REPORTED_INDICES)
        .collect();

    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(UploadError::IncompleteUpload {
            expected: declared,
            missing,
            unexpected,
        });
    }

    Ok(latest.into_values().cloned().collect())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

async fn discard_file(path: &Path) {
    if let Err(e) = remove_if_present(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
    }
}
