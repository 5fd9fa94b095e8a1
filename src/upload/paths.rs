//! On-disk layout of the upload directory
//!
//! ```text
//! <upload_dir>/pending/<blob>     encrypted chunks
//! <upload_dir>/staging/<file>     merges in flight
//! <upload_dir>/<public_id>        published artifacts
//! ```

use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct UploadPaths {
    root: PathBuf,
}

impl UploadPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory tree if missing
    pub async fn ensure(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(self.pending_dir()).await?;
        tokio::fs::create_dir_all(self.staging_dir()).await?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.root.join("pending")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn chunk_path(&self, blob_name: &str) -> PathBuf {
        self.pending_dir().join(blob_name)
    }

    /// Write target for a chunk; renamed over `chunk_path` once complete
    pub fn chunk_temp_path(&self, blob_name: &str) -> PathBuf {
        self.pending_dir()
            .join(format!("{}.{}.tmp", blob_name, Uuid::new_v4().simple()))
    }

    /// Fresh staging file for one merge attempt
    pub fn staging_path(&self, session_id: &str) -> PathBuf {
        self.staging_dir()
            .join(format!("{}.{}.part", session_id, Uuid::new_v4().simple()))
    }

    pub fn artifact_path(&self, public_id: &str) -> PathBuf {
        self.root.join(public_id)
    }
}

/// Remove a file. Returns `false` if it was already gone.
pub async fn remove_if_present(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
