//! Database schema definitions

use crate::{DbError, DbResult};
use sqlx::SqlitePool;

/// Version of the credential collection layout, shared by every backend
pub const STORE_SCHEMA_VERSION: u32 = 1;

/// SQL to create all tables
/// NOTE: `position` preserves the order the collection was written in
pub const CREATE_TABLES: &str = r#"
-- Store metadata (schema version)
CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Credential sets, rewritten as a whole on every mutation
CREATE TABLE IF NOT EXISTS credential_sets (
    id TEXT PRIMARY KEY,
    position INTEGER NOT NULL,
    name TEXT NOT NULL,
    exchange_id TEXT NOT NULL,
    api_key TEXT NOT NULL,
    secret_key TEXT NOT NULL,
    additional_fields TEXT,
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_credential_position ON credential_sets(position)
"#;

/// Read the schema version stamped into `store_meta`
pub async fn read_schema_version(pool: &SqlitePool) -> DbResult<u32> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT value FROM store_meta WHERE key = 'schema_version'")
            .fetch_optional(pool)
            .await?;

    match row {
        Some((value,)) => value
            .parse()
            .map_err(|_| DbError::Migration(format!("invalid schema_version '{value}'"))),
        None => Ok(0),
    }
}
