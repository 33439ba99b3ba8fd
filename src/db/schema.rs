//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- One row per transfer attempt; timestamps are fixed-width RFC 3339 UTC
CREATE TABLE IF NOT EXISTS file_transfers (
    id TEXT PRIMARY KEY,
    file_name TEXT NOT NULL,
    content_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    sender_user_id TEXT NOT NULL,
    target_user_id TEXT NOT NULL,
    sender_device_id TEXT NOT NULL,
    target_device_id TEXT NOT NULL,
    chunk_size_bytes INTEGER NOT NULL,
    packet_count INTEGER NOT NULL,
    topic TEXT NOT NULL,
    broker_partition INTEGER,
    start_offset INTEGER,
    end_offset INTEGER,
    encryption_envelope TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    failure_reason TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_file_transfers_status_expires ON file_transfers(status, expires_at);
CREATE INDEX IF NOT EXISTS idx_file_transfers_target_device ON file_transfers(target_device_id, status);
CREATE INDEX IF NOT EXISTS idx_file_transfers_sender_user ON file_transfers(sender_user_id);
CREATE INDEX IF NOT EXISTS idx_file_transfers_target_user ON file_transfers(target_user_id);
"#;
