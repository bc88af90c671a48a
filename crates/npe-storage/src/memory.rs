//! In-process store used by tests and dry runs.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use npe_core::{FieldMap, Record};
use tokio::sync::Mutex;

use crate::{merge_fields, RecordStore, RecordStream, SnapshotStream, StoreError};

/// One accepted partial update, kept so callers can inspect what was written.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteLogEntry {
    pub collection: String,
    pub id: String,
    pub fields: FieldMap,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<BTreeMap<String, Vec<Record>>>,
    writes: Mutex<Vec<WriteLogEntry>>,
    rejected_ids: HashSet<String>,
    unavailable: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `collection`; records keep the given iteration order.
    pub fn with_collection(mut self, collection: &str, records: Vec<Record>) -> Self {
        self.collections
            .get_mut()
            .insert(collection.to_string(), records);
        self
    }

    /// Make every write to record `id` fail.
    pub fn rejecting_writes_for(mut self, id: &str) -> Self {
        self.rejected_ids.insert(id.to_string());
        self
    }

    /// Make `stream` fail as if the backend could not be reached.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub async fn records(&self, collection: &str) -> Vec<Record> {
        self.collections
            .lock()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn write_log(&self) -> Vec<WriteLogEntry> {
        self.writes.lock().await.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn stream(&self, collection: &str) -> Result<Box<dyn RecordStream>, StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        let snapshot = self.records(collection).await;
        Ok(Box::new(SnapshotStream::new(snapshot)))
    }

    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: &FieldMap,
    ) -> Result<(), StoreError> {
        if self.rejected_ids.contains(id) {
            return Err(StoreError::write(collection, id, "rejected by store"));
        }
        let mut collections = self.collections.lock().await;
        let record = collections
            .get_mut(collection)
            .and_then(|records| records.iter_mut().find(|r| r.id == id))
            .ok_or_else(|| StoreError::write(collection, id, "no such record"))?;
        merge_fields(&mut record.fields, fields);
        drop(collections);

        self.writes.lock().await.push(WriteLogEntry {
            collection: collection.to_string(),
            id: id.to_string(),
            fields: fields.clone(),
        });
        Ok(())
    }

    async fn upsert(&self, collection: &str, record: &Record) -> Result<(), StoreError> {
        if self.rejected_ids.contains(&record.id) {
            return Err(StoreError::write(collection, &record.id, "rejected by store"));
        }
        let mut collections = self.collections.lock().await;
        let records = collections.entry(collection.to_string()).or_default();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => merge_fields(&mut existing.fields, &record.fields),
            None => records.push(record.clone()),
        }
        Ok(())
    }
}
