//! Upload types for the chunk/merge protocol

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::crypto::Fingerprint;
use super::validate;

// ============================================================================
// Constants
// ============================================================================

/// Trailing window for per-uploader quotas
pub const QUOTA_WINDOW_SECS: i64 = 24 * 60 * 60;

/// Suggested retry delay for storage-class quota violations
pub const QUOTA_RETRY_AFTER_SECS: u64 = 24 * 60 * 60;

/// Leading bytes kept from an assembled artifact for type sniffing
pub const SNIFF_WINDOW: usize = 4100;

/// Maximum length of an original file name
pub const MAX_NAME_LEN: usize = 255;

// ============================================================================
// Chunk Types
// ============================================================================

/// A chunk ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRef {
    /// Ledger row id
    pub id: i64,

    /// Upload session the chunk belongs to
    pub session_id: String,

    /// Zero-based ordinal within the session
    pub index: u32,

    /// Encrypted blob name under `pending/`
    pub blob_name: String,

    /// When the chunk was received
    pub received_at: DateTime<Utc>,
}

/// Response after storing a chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub blob_name: String,
    pub index: u32,
}

// ============================================================================
// Merge Types
// ============================================================================

/// Request to assemble a session's chunks into an artifact
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub session_id: String,
    pub original_name: String,
    pub declared_chunk_count: u32,
    pub owner: Fingerprint,
    pub collection_id: Option<String>,
    /// Client-supplied SHA-256 (lowercase hex) of the whole file
    pub checksum: Option<String>,
}

impl MergeRequest {
    pub fn new(
        session_id: impl Into<String>,
        original_name: impl Into<String>,
        declared_chunk_count: u32,
        owner: Fingerprint,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            original_name: original_name.into(),
            declared_chunk_count,
            owner,
            collection_id: None,
            checksum: None,
        }
    }

    pub fn with_collection(mut self, collection_id: impl Into<String>) -> Self {
        self.collection_id = Some(collection_id.into());
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Reject malformed input before any storage is touched.
    /// Normalizes the name (trimmed) and checksum (lowercase).
    pub fn validate(mut self) -> Result<Self, UploadError> {
        validate::session_id(&self.session_id)?;
        self.original_name = validate::original_name(&self.original_name)?;
        if self.declared_chunk_count == 0 {
            return Err(UploadError::InvalidInput(
                "chunkCount must be a positive integer".to_string(),
            ));
        }
        if let Some(collection_id) = &self.collection_id {
            validate::collection_id(collection_id)?;
        }
        if let Some(checksum) = self.checksum.take() {
            self.checksum = Some(validate::checksum(&checksum)?);
        }
        Ok(self)
    }
}

/// A published artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub public_id: String,
    pub original_name: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub owner_fingerprint: Fingerprint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_checksum: Option<String>,
}

/// Client-facing view of an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSummary {
    pub public_id: String,
    pub original_name: String,
    /// Sanitized name safe for a download header
    pub download_name: String,
    /// Guessed from the original name
    pub mime_type: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl From<&ArtifactRecord> for ArtifactSummary {
    fn from(record: &ArtifactRecord) -> Self {
        Self {
            public_id: record.public_id.clone(),
            original_name: record.original_name.clone(),
            download_name: validate::sanitize_filename(&record.original_name),
            mime_type: mime_guess::from_path(&record.original_name)
                .first_or_octet_stream()
                .to_string(),
            size_bytes: record.size_bytes,
            created_at: record.created_at,
        }
    }
}

impl ArtifactSummary {
    /// `Content-Disposition` value with an RFC 5987 UTF-8 fallback
    pub fn content_disposition(&self) -> String {
        let disposition = if self.mime_type.starts_with("image/") {
            "inline"
        } else {
            "attachment"
        };
        // Quotes and backslashes would end the quoted-string early
        let quoted: String = self
            .download_name
            .chars()
            .map(|c| if c == '"' || c == '\\' { '_' } else { c })
            .collect();
        format!(
            "{}; filename=\"{}\"; filename*=UTF-8''{}",
            disposition,
            quoted,
            urlencoding::encode(&self.download_name)
        )
    }
}

// ============================================================================
// Session Types
// ============================================================================

/// Upload session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Chunks arriving
    Collecting,
    /// Merge in progress
    Merging,
    /// Artifact visible, chunks gone
    Published,
    /// Last merge attempt failed; chunks may remain
    Failed,
}

// ============================================================================
// Quota Types
// ============================================================================

/// Which quota was violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    GlobalStorage,
    DailyBytes,
    DailyFiles,
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::GlobalStorage => "server storage quota",
            Self::DailyBytes => "daily upload quota",
            Self::DailyFiles => "daily file upload limit",
        };
        f.write_str(s)
    }
}

/// Used/limit pair for one quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLine {
    pub used: u64,
    pub limit: u64,
}

/// Per-uploader part of a usage snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploaderUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<UsageLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<UsageLine>,
}

/// Quota usage snapshot for display
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global: Option<UsageLine>,
    pub per_uploader: UploaderUsage,
}

// ============================================================================
// Error Types
// ============================================================================

/// Broad error classes, used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected before touching storage
    Validation,
    /// Rejected after partial work; partial state already cleaned up
    Policy,
    /// Lookups that found nothing usable
    Lookup,
    /// Disk or ledger failure
    Storage,
    /// Lost a race; resubmit the whole merge
    Race,
}

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Quota exceeded ({kind}): {used} >= {limit}")]
    QuotaExceeded {
        kind: QuotaKind,
        used: u64,
        limit: u64,
        retry_after_secs: u64,
    },

    #[error("Incomplete upload: expected {expected} chunks, missing {missing:?}, unexpected {unexpected:?}")]
    IncompleteUpload {
        expected: u32,
        missing: Vec<u32>,
        unexpected: Vec<u32>,
    },

    #[error("File too large: {actual} bytes (max: {limit})")]
    ArtifactTooLarge { limit: u64, actual: u64 },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("File type not allowed: {mime}")]
    TypeBlocked { mime: String },

    #[error("Duplicate identifier: {0}")]
    DuplicateIdentifier(String),

    #[error("Merge already in progress for session {0}")]
    MergeInProgress(String),

    #[error("No free identifier could be allocated")]
    AllocationExhausted,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Expired: {0}")]
    Expired(String),

    #[error("Chunk failed authentication: {blob_name}")]
    CorruptChunk { blob_name: String },

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl UploadError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidInput(_) | Self::IncompleteUpload { .. } => ErrorClass::Validation,
            Self::QuotaExceeded { .. }
            | Self::ArtifactTooLarge { .. }
            | Self::IntegrityMismatch { .. }
            | Self::TypeBlocked { .. } => ErrorClass::Policy,
            Self::NotFound(_) | Self::Expired(_) => ErrorClass::Lookup,
            Self::DuplicateIdentifier(_) | Self::MergeInProgress(_) => ErrorClass::Race,
            Self::AllocationExhausted
            | Self::CorruptChunk { .. }
            | Self::Timeout(_)
            | Self::Storage(_)
            | Self::Database(_) => ErrorClass::Storage,
        }
    }

    /// Whether resubmitting the same request can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Storage | ErrorClass::Race)
    }

    /// Suggested delay before retrying, in seconds
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::QuotaExceeded {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::QuotaExceeded {
                kind: QuotaKind::GlobalStorage,
                ..
            } => StatusCode::INSUFFICIENT_STORAGE,
            Self::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::IncompleteUpload { .. } => StatusCode::BAD_REQUEST,
            Self::ArtifactTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::IntegrityMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::TypeBlocked { .. } => StatusCode::FORBIDDEN,
            Self::DuplicateIdentifier(_) => StatusCode::CONFLICT,
            Self::MergeInProgress(_) => StatusCode::CONFLICT,
            Self::AllocationExhausted => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Expired(_) => StatusCode::GONE,
            Self::CorruptChunk { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            Self::ArtifactTooLarge { .. } => "ARTIFACT_TOO_LARGE",
            Self::IntegrityMismatch { .. } => "INTEGRITY_MISMATCH",
            Self::TypeBlocked { .. } => "TYPE_BLOCKED",
            Self::DuplicateIdentifier(_) => "DUPLICATE_IDENTIFIER",
            Self::MergeInProgress(_) => "MERGE_IN_PROGRESS",
            Self::AllocationExhausted => "ALLOCATION_EXHAUSTED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Expired(_) => "EXPIRED",
            Self::CorruptChunk { .. } => "CORRUPT_CHUNK",
            Self::Timeout(_) => "TIMEOUT",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
        }
    }
}
