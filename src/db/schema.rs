//! Database schema initialization

use sqlx::SqlitePool;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Chunk ledger. (session_id, chunk_index) is intentionally not unique:
-- retried chunks append, merge keeps the newest row per index.
CREATE TABLE IF NOT EXISTS uploaded_chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    blob_name TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    received_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_uploaded_chunks_session ON uploaded_chunks(session_id, chunk_index);
CREATE INDEX IF NOT EXISTS idx_uploaded_chunks_received ON uploaded_chunks(received_at);

-- Artifact ledger
CREATE TABLE IF NOT EXISTS artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id TEXT NOT NULL UNIQUE,
    original_name TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    owner_fingerprint TEXT NOT NULL,
    collection_id TEXT,
    content_checksum TEXT
);

CREATE INDEX IF NOT EXISTS idx_artifacts_collection ON artifacts(collection_id);
CREATE INDEX IF NOT EXISTS idx_artifacts_owner_created ON artifacts(owner_fingerprint, created_at);
CREATE INDEX IF NOT EXISTS idx_artifacts_created ON artifacts(created_at);

-- Audit log
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    details TEXT,
    status TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_log_created ON audit_log(created_at);
CREATE INDEX IF NOT EXISTS idx_audit_log_event ON audit_log(event_type);
"#;
