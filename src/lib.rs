//! Chunkdrop Server Library
//!
//! Chunked upload ingestion and merge pipeline. The transport layer calls
//! into [`upload::UploadService`]; [`retention::RetentionSweeper`] runs
//! alongside it.
//!
//! # Modules
//!
//! - `upload`: chunk store, quota tracker, identifier allocator, merge pipeline
//! - `retention`: periodic cleanup of chunks, artifacts and audit rows
//! - `db`: SQLite ledger

pub mod config;
pub mod db;
pub mod error;
pub mod retention;
pub mod upload;
