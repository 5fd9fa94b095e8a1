//! Chunk Store
//!
//! Encrypted per-chunk blobs under `pending/` plus the chunk ledger.
//! The ledger row is always written before its blob, so every blob on
//! disk is reachable from the ledger (and from the sweeper).

use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use sqlx::SqlitePool;

use super::crypto::{chunk_blob_name, ChunkCipher, Fingerprint};
use super::paths::{remove_if_present, UploadPaths};
use super::types::{ChunkReceipt, ChunkRef, UploadError};
use crate::db::{delete_chunk_rows, ChunkRepository};

/// Encrypted chunk storage keyed by session id
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    pool: SqlitePool,
    paths: UploadPaths,
    cipher: ChunkCipher,
    secret: String,
}

impl ChunkStore {
    pub fn new(pool: SqlitePool, paths: UploadPaths, cipher: ChunkCipher, secret: &str) -> Self {
        Self {
            inner: Arc::new(ChunkStoreInner {
                pool,
                paths,
                cipher,
                secret: secret.to_string(),
            }),
        }
    }

    pub fn paths(&self) -> &UploadPaths {
        &self.inner.paths
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    /// Encrypt and persist one chunk
    pub async fn put_chunk(
        &self,
        session_id: &str,
        index: u32,
        data: &[u8],
        owner: &Fingerprint,
    ) -> Result<ChunkReceipt, UploadError> {
        if data.is_empty() {
            return Err(UploadError::InvalidInput("Empty chunk".to_string()));
        }

        let blob_name = chunk_blob_name(index, &self.inner.secret, owner, session_id);
        let sealed = self
            .inner
            .cipher
            .seal(&blob_name, data)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        ChunkRepository::new(&self.inner.pool)
            .insert(session_id, index, &blob_name, owner.as_str(), Utc::now())
            .await?;

        // Temp name + rename: readers never observe a torn chunk
        let temp_path = self.inner.paths.chunk_temp_path(&blob_name);
        let final_path = self.inner.paths.chunk_path(&blob_name);
        if let Err(e) = write_then_rename(&temp_path, &final_path, &sealed).await {
            let _ = remove_if_present(&temp_path).await;
            return Err(e.into());
        }

        tracing::debug!(
            session_id = %session_id,
            chunk_index = index,
            size = data.len(),
            "Stored chunk"
        );

        Ok(ChunkReceipt { blob_name, index })
    }

    /// Every ledger row for a session, ascending by index
    pub async fn list_chunks(&self, session_id: &str) -> Result<Vec<ChunkRef>, UploadError> {
        let rows = ChunkRepository::new(&self.inner.pool)
            .list_for_session(session_id)
            .await?;

        Ok(rows.into_iter().map(ChunkRef::from).collect())
    }

    /// Read and authenticate one chunk
    pub async fn read_chunk(&self, chunk: &ChunkRef) -> Result<Vec<u8>, UploadError> {
        let sealed = tokio::fs::read(self.inner.paths.chunk_path(&chunk.blob_name)).await?;

        self.inner
            .cipher
            .open(&chunk.blob_name, &sealed)
            .map_err(|e| {
                tracing::error!(
                    session_id = %chunk.session_id,
                    chunk_index = chunk.index,
                    error = %e,
                    "Chunk failed authentication"
                );
                UploadError::CorruptChunk {
                    blob_name: chunk.blob_name.clone(),
                }
            })
    }

    /// Remove chunk blobs and their ledger rows
    pub async fn delete_chunks(&self, chunks: &[ChunkRef]) -> Result<(), UploadError> {
        self.delete_chunk_files(chunks).await;

        let ids: Vec<i64> = chunks.iter().map(|c| c.id).collect();
        delete_chunk_rows(&self.inner.pool, &ids).await?;
        Ok(())
    }

    /// Remove chunk blobs only. Failures are logged; the sweeper retries.
    ///
    /// Returns the number of blobs removed.
    pub async fn delete_chunk_files(&self, chunks: &[ChunkRef]) -> usize {
        let blob_names: HashSet<&str> = chunks.iter().map(|c| c.blob_name.as_str()).collect();

        let results = join_all(blob_names.into_iter().map(|name| async move {
            let path = self.inner.paths.chunk_path(name);
            (name, remove_if_present(&path).await)
        }))
        .await;

        let mut removed = 0;
        for (name, result) in results {
            match result {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(blob = %name, error = %e, "Failed to delete chunk"),
            }
        }
        removed
    }
}

async fn write_then_rename(
    temp_path: &std::path::Path,
    final_path: &std::path::Path,
    data: &[u8],
) -> io::Result<()> {
    tokio::fs::write(temp_path, data).await?;
    tokio::fs::rename(temp_path, final_path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool_at;
    use tempfile::TempDir;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    async fn store(dir: &TempDir) -> ChunkStore {
        let pool = create_pool_at(&dir.path().join("test.db")).await.unwrap();
        let paths = UploadPaths::new(dir.path().join("uploads"));
        paths.ensure().await.unwrap();
        ChunkStore::new(pool, paths, ChunkCipher::derive(SECRET, 1_000), SECRET)
    }

    fn owner() -> Fingerprint {
        Fingerprint::from_address(Some("192.0.2.10"), SECRET)
    }

    #[tokio::test]
    async fn test_put_and_read_chunk() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let receipt = store.put_chunk("session", 0, b"hello chunk", &owner()).await.unwrap();
        assert_eq!(receipt.index, 0);

        // At rest the bytes are not plaintext
        let raw = tokio::fs::read(store.paths().chunk_path(&receipt.blob_name))
            .await
            .unwrap();
        assert!(!raw.windows(11).any(|w| w == b"hello chunk"));

        let chunks = store.list_chunks("session").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(store.read_chunk(&chunks[0]).await.unwrap(), b"hello chunk");
    }

    #[tokio::test]
    async fn test_empty_chunk_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let result = store.put_chunk("session", 0, b"", &owner()).await;
        assert!(matches!(result, Err(UploadError::InvalidInput(_))));
        assert!(store.list_chunks("session").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chunks_listed_in_index_order() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        for index in [2u32, 0, 1] {
            store
                .put_chunk("session", index, &[index as u8 + 1], &owner())
                .await
                .unwrap();
        }
        store.put_chunk("other", 0, b"x", &owner()).await.unwrap();

        let indices: Vec<u32> = store
            .list_chunks("session")
            .await
            .unwrap()
            .iter()
            .map(|c| c.index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_tampered_chunk_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let receipt = store.put_chunk("session", 0, b"payload", &owner()).await.unwrap();
        let path = store.paths().chunk_path(&receipt.blob_name);
        let mut raw = tokio::fs::read(&path).await.unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        tokio::fs::write(&path, raw).await.unwrap();

        let chunks = store.list_chunks("session").await.unwrap();
        assert!(matches!(
            store.read_chunk(&chunks[0]).await,
            Err(UploadError::CorruptChunk { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_chunks_removes_files_and_rows() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store.put_chunk("session", 0, b"a", &owner()).await.unwrap();
        // Retried chunk: second row, same blob
        store.put_chunk("session", 0, b"a", &owner()).await.unwrap();
        let chunks = store.list_chunks("session").await.unwrap();
        assert_eq!(chunks.len(), 2);

        store.delete_chunks(&chunks).await.unwrap();
        assert!(store.list_chunks("session").await.unwrap().is_empty());
        assert!(!store.paths().chunk_path(&chunks[0].blob_name).exists());

        // Already gone is fine
        assert_eq!(store.delete_chunk_files(&chunks).await, 0);
    }
}
