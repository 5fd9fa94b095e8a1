//! Chunked Upload Module
//!
//! Implements large file ingestion with:
//! - Encrypted at-rest chunk storage (AES-256-GCM)
//! - Exactly-once assembly into a published artifact
//! - Quota, size, integrity and content-type policy before publication
//!
//! Protocol Flow:
//! 1. Client sends chunks tagged with a session id, in any order, retrying freely
//! 2. Quotas are checked when chunk 0 arrives
//! 3. Client requests a merge with the declared chunk count
//! 4. Server assembles, checks policy and returns the public identifier

pub mod audit;
pub mod chunk_store;
pub mod crypto;
pub mod identifier;
pub mod merge;
pub mod paths;
pub mod quota;
pub mod service;
pub mod session;
pub mod sniff;
pub mod types;
pub mod validate;

pub use audit::{AuditEvent, AuditLog, AuditStatus};
pub use chunk_store::ChunkStore;
pub use crypto::{chunk_blob_name, compute_hash, ChunkCipher, CryptoError, Fingerprint};
pub use identifier::{HashSeed, IdAllocator, IdentifierLedger, Reservation};
pub use merge::{select_chunks, MergePipeline, MergePolicy};
pub use paths::{remove_if_present, UploadPaths};
pub use quota::QuotaTracker;
pub use service::UploadService;
pub use session::{MergeGuard, MergeTracker};
pub use sniff::{is_blocked, sniff_mime};
pub use types::*;
