//! Core record model and slug derivation for the catalog tools.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod slug;

pub use slug::{normalize, SlugError, SLUG_MAX_LEN};

pub const CRATE_NAME: &str = "npe-core";

/// Field name holding the derived slug on every catalog record.
pub const SLUG_FIELD: &str = "slug";

/// Field name carrying the record identifier in exported/local documents.
pub const ID_FIELD: &str = "id";

/// Field map of a single document. Backed by a `BTreeMap`, so iteration and
/// serialization order are stable across runs.
pub type FieldMap = serde_json::Map<String, Value>;

/// A stored document: an opaque store-assigned id plus its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub fields: FieldMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("document has no usable `id` field")]
    MissingId,
}

impl Record {
    pub fn new(id: impl Into<String>, fields: FieldMap) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Build a record from a flat document (`{ "id": .., ...fields }`), the shape
    /// used by exports and local collection files. Integer ids are accepted.
    pub fn from_document(mut document: FieldMap) -> Result<Self, RecordError> {
        let id = document
            .remove(ID_FIELD)
            .as_ref()
            .and_then(join_key_string)
            .ok_or(RecordError::MissingId)?;
        Ok(Self {
            id,
            fields: document,
        })
    }

    /// Flatten back into a document with the id stored under `id`.
    pub fn to_document(&self) -> FieldMap {
        let mut document = self.fields.clone();
        document.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        document
    }

    /// Presence check: a key holding `null` still counts as present.
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn text_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// The record's slug when it is a non-empty string.
    pub fn slug(&self) -> Option<&str> {
        self.text_field(SLUG_FIELD).filter(|s| !s.is_empty())
    }
}

/// Render a JSON value as a join key. Strings join as-is and integers in
/// decimal; empty strings and every other JSON type do not join.
pub fn join_key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}
