//! Storage backends for the credential collection
//!
//! Every backend exposes the same two operations: read the whole collection,
//! and replace the whole collection. Callers do read-modify-write on top.

use crate::repository::{CredentialRecord, CredentialRepository};
use crate::schema::STORE_SCHEMA_VERSION;
use crate::{DbError, DbResult, SqlitePool};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Durable (or in-memory) home of the credential collection
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    /// Read the full collection
    async fn load_all(&self) -> DbResult<Vec<CredentialRecord>>;

    /// Replace the full collection atomically
    async fn store_all(&self, records: &[CredentialRecord]) -> DbResult<()>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local backend, used by tests and `--ephemeral` runs
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<Vec<CredentialRecord>>,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed `store_all` calls
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialBackend for MemoryBackend {
    async fn load_all(&self) -> DbResult<Vec<CredentialRecord>> {
        let records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(records.clone())
    }

    async fn store_all(&self, records: &[CredentialRecord]) -> DbResult<()> {
        let mut stored = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *stored = records.to_vec();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON file
// ---------------------------------------------------------------------------

/// On-disk document written by [`JsonFileBackend`]
#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    saved_at: Option<DateTime<Utc>>,
    credentials: Vec<CredentialRecord>,
}

/// Either the versioned document or the unversioned bare array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredLayout {
    Versioned(StoreDocument),
    Legacy(Vec<CredentialRecord>),
}

/// Single JSON file; writes go to a sibling temp file and are renamed into place
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CredentialBackend for JsonFileBackend {
    async fn load_all(&self) -> DbResult<Vec<CredentialRecord>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        match serde_json::from_slice::<StoredLayout>(&raw)? {
            StoredLayout::Versioned(doc) => {
                if doc.version > STORE_SCHEMA_VERSION {
                    return Err(DbError::UnsupportedVersion {
                        found: doc.version,
                        supported: STORE_SCHEMA_VERSION,
                    });
                }
                Ok(doc.credentials)
            }
            StoredLayout::Legacy(records) => {
                debug!(path = %self.path.display(), "Read unversioned credential file");
                Ok(records)
            }
        }
    }

    async fn store_all(&self, records: &[CredentialRecord]) -> DbResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let doc = StoreDocument {
            version: STORE_SCHEMA_VERSION,
            saved_at: Some(Utc::now()),
            credentials: records.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&doc)?;

        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), count = records.len(), "Credential file written");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// SQLite-backed collection (see `schema::CREATE_TABLES`)
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialBackend for SqliteBackend {
    async fn load_all(&self) -> DbResult<Vec<CredentialRecord>> {
        CredentialRepository::new(&self.pool).load_all().await
    }

    async fn store_all(&self, records: &[CredentialRecord]) -> DbResult<()> {
        CredentialRepository::new(&self.pool)
            .replace_all(records)
            .await
    }
}
