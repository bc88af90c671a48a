//! Join-key merge of external attribute rows onto base documents.

use std::collections::HashMap;

use npe_core::{join_key_string, FieldMap};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Two rows with the same key make the table ambiguous and are refused.
    #[default]
    Reject,
    LastWins,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("duplicate join key {key:?} in attribute rows")]
    DuplicateJoinKey { key: String },
    #[error("attribute row {index} has no usable {key_field:?} value")]
    MissingJoinKey { index: usize, key_field: String },
}

/// Attribute rows indexed by join key. The key column itself is not stored.
#[derive(Debug, Clone, Default)]
pub struct AttributeTable {
    key_field: String,
    rows: HashMap<String, FieldMap>,
}

impl AttributeTable {
    /// Index `rows` by `key_field`. When `columns` is given only those columns
    /// are kept as attributes.
    pub fn from_rows(
        rows: impl IntoIterator<Item = FieldMap>,
        key_field: &str,
        columns: Option<&[String]>,
        policy: DuplicatePolicy,
    ) -> Result<Self, MergeError> {
        let mut indexed = HashMap::new();
        for (index, mut row) in rows.into_iter().enumerate() {
            let key = row
                .remove(key_field)
                .as_ref()
                .and_then(join_key_string)
                .ok_or_else(|| MergeError::MissingJoinKey {
                    index,
                    key_field: key_field.to_string(),
                })?;
            if let Some(columns) = columns {
                row.retain(|name, _| columns.iter().any(|c| c == name));
            }
            if indexed.insert(key.clone(), row).is_some() && policy == DuplicatePolicy::Reject {
                return Err(MergeError::DuplicateJoinKey { key });
            }
        }
        Ok(Self {
            key_field: key_field.to_string(),
            rows: indexed,
        })
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    pub fn get(&self, key: &str) -> Option<&FieldMap> {
        self.rows.get(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub records: Vec<FieldMap>,
    pub matched: usize,
    pub unmatched: usize,
}

/// Overlay matching attribute rows onto `base`, keeping order and every record.
pub fn merge(
    base: impl IntoIterator<Item = FieldMap>,
    table: &AttributeTable,
    join_key: &str,
) -> Vec<FieldMap> {
    merge_with_stats(base, table, join_key).records
}

pub fn merge_with_stats(
    base: impl IntoIterator<Item = FieldMap>,
    table: &AttributeTable,
    join_key: &str,
) -> MergeOutcome {
    let mut matched = 0;
    let mut unmatched = 0;
    let records = base
        .into_iter()
        .map(|mut record| {
            let attributes = record
                .get(join_key)
                .and_then(join_key_string)
                .and_then(|key| table.get(&key));
            match attributes {
                Some(attributes) => {
                    matched += 1;
                    for (name, value) in attributes {
                        record.insert(name.clone(), value.clone());
                    }
                }
                None => unmatched += 1,
            }
            record
        })
        .collect();
    MergeOutcome {
        records,
        matched,
        unmatched,
    }
}
