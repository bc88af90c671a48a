//! Collection-per-file store: `<root>/<collection>.json` holds a JSON array of
//! flat documents (`{ "id": .., ...fields }`), the same shape `export` writes.
//!
//! Every write rewrites the collection file atomically. Fine for local catalogs
//! and emulator-free testing; not meant for large collections.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use npe_core::{FieldMap, Record};
use serde_json::Value;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    merge_fields, write_file_atomic, RecordStore, RecordStream, SnapshotStream, StoreError,
};

#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DirectoryStore {
    /// Open a store rooted at an existing directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let is_dir = fs::metadata(&root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(StoreError::Unavailable(format!(
                "store directory {} does not exist",
                root.display()
            )));
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn collection_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.json"))
    }

    async fn load(&self, collection: &str) -> Result<Vec<Record>, StoreError> {
        let path = self.collection_path(collection);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(StoreError::read(
                    collection,
                    format!("reading {}: {err}", path.display()),
                ))
            }
        };
        let documents: Vec<Value> = serde_json::from_str(&text).map_err(|err| {
            StoreError::read(collection, format!("parsing {}: {err}", path.display()))
        })?;
        documents
            .into_iter()
            .enumerate()
            .map(|(index, document)| match document {
                Value::Object(map) => Record::from_document(map).map_err(|err| {
                    StoreError::read(collection, format!("document {index}: {err}"))
                }),
                _ => Err(StoreError::read(
                    collection,
                    format!("document {index} is not an object"),
                )),
            })
            .collect()
    }

    async fn save(&self, collection: &str, records: &[Record]) -> Result<(), String> {
        let documents: Vec<Value> = records
            .iter()
            .map(|r| Value::Object(r.to_document()))
            .collect();
        let bytes = serde_json::to_vec_pretty(&documents).map_err(|e| e.to_string())?;
        let path = self.collection_path(collection);
        let stored = write_file_atomic(&path, &bytes)
            .await
            .map_err(|e| format!("{e:#}"))?;
        debug!(path = %stored.path.display(), bytes = stored.byte_size, "collection file written");
        Ok(())
    }

    async fn modify<F>(&self, collection: &str, id: &str, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Vec<Record>) -> Result<(), String> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut records = self
            .load(collection)
            .await
            .map_err(|err| StoreError::write(collection, id, err.to_string()))?;
        apply(&mut records).map_err(|message| StoreError::write(collection, id, message))?;
        self.save(collection, &records)
            .await
            .map_err(|message| StoreError::write(collection, id, message))
    }
}

#[async_trait]
impl RecordStore for DirectoryStore {
    fn backend_name(&self) -> &'static str {
        "directory"
    }

    async fn stream(&self, collection: &str) -> Result<Box<dyn RecordStream>, StoreError> {
        let records = self.load(collection).await?;
        Ok(Box::new(SnapshotStream::new(records)))
    }

    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: &FieldMap,
    ) -> Result<(), StoreError> {
        self.modify(collection, id, |records| {
            let record = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| "no such record".to_string())?;
            merge_fields(&mut record.fields, fields);
            Ok(())
        })
        .await
    }

    async fn upsert(&self, collection: &str, record: &Record) -> Result<(), StoreError> {
        self.modify(collection, &record.id, |records| {
            match records.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => merge_fields(&mut existing.fields, &record.fields),
                None => records.push(record.clone()),
            }
            Ok(())
        })
        .await
    }
}
