//! Record store contracts, store backends and atomic file output.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use npe_core::{FieldMap, Record};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod directory;
pub mod firestore;
pub mod memory;

pub use directory::DirectoryStore;
pub use firestore::{FirestoreConfig, FirestoreCredentials, FirestoreStore};
pub use memory::MemoryStore;

pub const CRATE_NAME: &str = "npe-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be reached at all; nothing can be processed.
    #[error("record source unavailable: {0}")]
    Unavailable(String),
    #[error("reading collection {collection}: {message}")]
    Read { collection: String, message: String },
    /// A single record write was rejected.
    #[error("write rejected for {collection}/{id}: {message}")]
    Write {
        collection: String,
        id: String,
        message: String,
    },
}

impl StoreError {
    pub fn write(collection: &str, id: &str, message: impl Into<String>) -> Self {
        Self::Write {
            collection: collection.to_string(),
            id: id.to_string(),
            message: message.into(),
        }
    }

    pub fn read(collection: &str, message: impl Into<String>) -> Self {
        Self::Read {
            collection: collection.to_string(),
            message: message.into(),
        }
    }
}

/// Forward-only cursor over a collection.
#[async_trait]
pub trait RecordStream: Send {
    async fn next_record(&mut self) -> Result<Option<Record>, StoreError>;
}

/// A document collection store with per-record partial updates.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Open a cursor over `collection`. Fails with [`StoreError::Unavailable`]
    /// when the store cannot be reached.
    async fn stream(&self, collection: &str) -> Result<Box<dyn RecordStream>, StoreError>;

    /// Set `fields` on an existing record, leaving every other field alone.
    /// Never creates a record.
    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: &FieldMap,
    ) -> Result<(), StoreError>;

    /// Merge-write a whole record, creating it when absent.
    async fn upsert(&self, collection: &str, record: &Record) -> Result<(), StoreError>;
}

/// Stream over an already materialized snapshot.
#[derive(Debug)]
pub struct SnapshotStream {
    records: std::vec::IntoIter<Record>,
}

impl SnapshotStream {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: records.into_iter(),
        }
    }
}

#[async_trait]
impl RecordStream for SnapshotStream {
    async fn next_record(&mut self) -> Result<Option<Record>, StoreError> {
        Ok(self.records.next())
    }
}

/// Merge `fields` into `target`, overwriting keys that already exist.
pub fn merge_fields(target: &mut FieldMap, fields: &FieldMap) {
    for (key, value) in fields {
        target.insert(key.clone(), value.clone());
    }
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    /// The file already held exactly these bytes and was left untouched.
    pub unchanged: bool,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` through a temp file and an atomic rename.
///
/// When the existing file already has the same content hash nothing is written.
pub async fn write_file_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<StoredFile> {
    let content_hash = sha256_hex(bytes);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }

    if fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        let existing = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if sha256_hex(&existing) == content_hash {
            return Ok(StoredFile {
                path: path.to_path_buf(),
                content_hash,
                byte_size: bytes.len(),
                unchanged: true,
            });
        }
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    publish_via_temp(&temp_path, path, bytes).await?;

    Ok(StoredFile {
        path: path.to_path_buf(),
        content_hash,
        byte_size: bytes.len(),
        unchanged: false,
    })
}

/// Write `bytes` to `temp_path` and rename it over `path`. The temp file is
/// removed whenever any step fails.
async fn publish_via_temp(temp_path: &Path, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let result = write_then_rename(temp_path, path, bytes).await;
    if result.is_err() {
        let _ = fs::remove_file(temp_path).await;
    }
    result
}

async fn write_then_rename(temp_path: &Path, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    fs::rename(temp_path, path).await.with_context(|| {
        format!(
            "atomically renaming {} -> {}",
            temp_path.display(),
            path.display()
        )
    })
}
