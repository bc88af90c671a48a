//! Local file adapters: JSON record arrays, attribute tables (JSON or CSV) and
//! JSON output files.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use npe_core::{FieldMap, Record};
use npe_storage::{write_file_atomic, StoredFile};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "npe-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    Json,
    Csv,
}

impl InputFormat {
    /// `.csv` files are CSV; everything else is read as JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => InputFormat::Csv,
            _ => InputFormat::Json,
        }
    }
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("{path}: expected a JSON array of objects")]
    NotAnArray { path: String },
    #[error("{path}: entry {index} is not an object")]
    NotAnObject { path: String, index: usize },
    #[error("{path}: entry {index} has no usable `id`")]
    MissingId { path: String, index: usize },
}

pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Read a JSON array of objects, keeping file order.
pub fn read_field_maps(path: impl AsRef<Path>) -> Result<Vec<FieldMap>> {
    let path = path.as_ref();
    let value: Value = read_json_file(path)?;
    let Value::Array(items) = value else {
        return Err(InputError::NotAnArray {
            path: path.display().to_string(),
        }
        .into());
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(map) => Ok(map),
            _ => Err(anyhow::Error::from(InputError::NotAnObject {
                path: path.display().to_string(),
                index,
            })),
        })
        .collect()
}

/// Read a JSON array of flat documents that each carry an `id`.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<Record>> {
    let path = path.as_ref();
    read_field_maps(path)?
        .into_iter()
        .enumerate()
        .map(|(index, document)| {
            Record::from_document(document).map_err(|_| {
                anyhow::Error::from(InputError::MissingId {
                    path: path.display().to_string(),
                    index,
                })
            })
        })
        .collect()
}

/// Parse CSV text with a header row; every cell becomes a JSON string.
/// Malformed rows are logged and skipped.
pub fn parse_csv_rows(content: &str) -> Result<Vec<FieldMap>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(content.as_bytes());
    let headers = reader.headers().context("reading CSV header row")?.clone();

    let mut rows = Vec::new();
    for (line, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(row = line + 1, "skipping malformed CSV row: {e}");
                continue;
            }
        };
        let row: FieldMap = headers
            .iter()
            .zip(record.iter())
            .map(|(name, cell)| (name.trim().to_string(), Value::String(cell.to_string())))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

pub fn read_csv_rows(path: impl AsRef<Path>) -> Result<Vec<FieldMap>> {
    let path = path.as_ref();
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_csv_rows(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Read attribute rows from a JSON array or a CSV file, chosen by extension.
pub fn read_attribute_rows(path: impl AsRef<Path>) -> Result<Vec<FieldMap>> {
    let path = path.as_ref();
    match InputFormat::from_path(path) {
        InputFormat::Csv => read_csv_rows(path),
        InputFormat::Json => read_field_maps(path),
    }
}

/// Write documents as a pretty-printed JSON array (two-space indent).
pub async fn write_field_maps(path: impl AsRef<Path>, documents: &[FieldMap]) -> Result<StoredFile> {
    let path = path.as_ref();
    let mut bytes = serde_json::to_vec_pretty(documents)
        .with_context(|| format!("serializing {}", path.display()))?;
    bytes.push(b'\n');
    write_file_atomic(path, &bytes).await
}
