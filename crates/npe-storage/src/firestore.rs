//! Firestore backend over the REST v1 API.
//!
//! Token minting is not handled here: the caller supplies an OAuth access token
//! (from the credential file or the environment).

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use npe_core::{FieldMap, Record};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Map, Number, Value};
use tracing::{debug, info_span, Instrument};

use crate::{RecordStore, RecordStream, StoreError};

pub const DEFAULT_BASE_URL: &str = "https://firestore.googleapis.com/v1";
pub const DEFAULT_DATABASE: &str = "(default)";
pub const DEFAULT_PAGE_SIZE: u32 = 300;

/// Subset of a service-account key file, plus an optional pre-issued token.
#[derive(Debug, Clone, Deserialize)]
pub struct FirestoreCredentials {
    pub project_id: String,
    #[serde(default)]
    pub access_token: Option<String>,
}

impl FirestoreCredentials {
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            StoreError::Unavailable(format!("reading credentials {}: {err}", path.display()))
        })?;
        serde_json::from_str(&text).map_err(|err| {
            StoreError::Unavailable(format!("parsing credentials {}: {err}", path.display()))
        })
    }
}

#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    pub project_id: String,
    pub access_token: String,
    pub base_url: String,
    pub database: String,
    pub page_size: u32,
    pub timeout: Duration,
}

impl FirestoreConfig {
    pub fn new(project_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            access_token: access_token.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            timeout: Duration::from_secs(30),
        }
    }

    fn documents_url(&self) -> String {
        format!(
            "{}/projects/{}/databases/{}/documents",
            self.base_url.trim_end_matches('/'),
            self.project_id,
            self.database
        )
    }

    /// Append `segments` to the documents URL, each percent-encoded as one
    /// path segment.
    fn documents_url_with(&self, segments: &[&str]) -> Result<Url, String> {
        let base = self.documents_url();
        let mut url = Url::parse(&base).map_err(|err| format!("invalid base url {base}: {err}"))?;
        url.path_segments_mut()
            .map_err(|_| format!("base url {base} cannot take path segments"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn collection_url(&self, collection: &str) -> Result<Url, String> {
        self.documents_url_with(&[collection])
    }

    fn document_url(&self, collection: &str, id: &str) -> Result<Url, String> {
        self.documents_url_with(&[collection, id])
    }
}

#[derive(Debug, Clone)]
pub struct FirestoreStore {
    client: reqwest::Client,
    config: FirestoreConfig,
}

impl FirestoreStore {
    pub fn new(config: FirestoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    async fn patch(
        &self,
        collection: &str,
        id: &str,
        fields: &FieldMap,
        must_exist: bool,
    ) -> Result<(), StoreError> {
        let mut query: Vec<(&str, String)> = fields
            .keys()
            .map(|name| ("updateMask.fieldPaths", quote_field_path(name)))
            .collect();
        if must_exist {
            query.push(("currentDocument.exists", "true".to_string()));
        }
        let body = json!({ "fields": encode_fields(fields) });
        let url = self
            .config
            .document_url(collection, id)
            .map_err(|message| StoreError::write(collection, id, message))?;

        let resp = self
            .client
            .patch(url)
            .bearer_auth(&self.config.access_token)
            .query(&query)
            .json(&body)
            .send()
            .await
            .map_err(|err| StoreError::write(collection, id, err.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = resp.text().await.unwrap_or_default();
        Err(StoreError::write(
            collection,
            id,
            format!("http status {}: {}", status.as_u16(), detail.trim()),
        ))
    }
}

#[async_trait]
impl RecordStore for FirestoreStore {
    fn backend_name(&self) -> &'static str {
        "firestore"
    }

    async fn stream(&self, collection: &str) -> Result<Box<dyn RecordStream>, StoreError> {
        let url = self
            .config
            .collection_url(collection)
            .map_err(StoreError::Unavailable)?;
        let mut pages = FirestorePages {
            client: self.client.clone(),
            url,
            access_token: self.config.access_token.clone(),
            page_size: self.config.page_size,
            collection: collection.to_string(),
            buffer: VecDeque::new(),
            next_page_token: None,
            exhausted: false,
        };
        // The first page is fetched eagerly so an unreachable store fails here.
        pages
            .fetch_page()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Box::new(pages))
    }

    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: &FieldMap,
    ) -> Result<(), StoreError> {
        self.patch(collection, id, fields, true).await
    }

    async fn upsert(&self, collection: &str, record: &Record) -> Result<(), StoreError> {
        self.patch(collection, &record.id, &record.fields, false)
            .await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<FirestoreDocument>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FirestoreDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

struct FirestorePages {
    client: reqwest::Client,
    url: Url,
    access_token: String,
    page_size: u32,
    collection: String,
    buffer: VecDeque<Record>,
    next_page_token: Option<String>,
    exhausted: bool,
}

impl FirestorePages {
    async fn fetch_page(&mut self) -> Result<(), StoreError> {
        let mut query = vec![("pageSize", self.page_size.to_string())];
        if let Some(token) = &self.next_page_token {
            query.push(("pageToken", token.clone()));
        }

        let span = info_span!("firestore_page", collection = %self.collection);
        let resp = self
            .client
            .get(self.url.clone())
            .bearer_auth(&self.access_token)
            .query(&query)
            .send()
            .instrument(span)
            .await
            .map_err(|err| StoreError::read(&self.collection, err.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(StoreError::read(
                &self.collection,
                format!("http status {}: {}", status.as_u16(), detail.trim()),
            ));
        }
        let page: ListDocumentsResponse = resp
            .json()
            .await
            .map_err(|err| StoreError::read(&self.collection, err.to_string()))?;

        debug!(
            collection = %self.collection,
            documents = page.documents.len(),
            "fetched firestore page"
        );
        self.buffer
            .extend(page.documents.into_iter().map(document_to_record));
        self.next_page_token = page.next_page_token.filter(|t| !t.is_empty());
        self.exhausted = self.next_page_token.is_none();
        Ok(())
    }
}

#[async_trait]
impl RecordStream for FirestorePages {
    async fn next_record(&mut self) -> Result<Option<Record>, StoreError> {
        while self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        Ok(self.buffer.pop_front())
    }
}

fn document_to_record(document: FirestoreDocument) -> Record {
    let id = document
        .name
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    Record::new(id, decode_fields(&document.fields))
}

/// Quote a field name for `updateMask.fieldPaths` unless it is a simple name.
pub fn quote_field_path(name: &str) -> String {
    let mut chars = name.chars();
    let simple = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        name.to_string()
    } else {
        format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

pub fn encode_fields(fields: &FieldMap) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(k, v)| (k.clone(), encode_value(v)))
            .collect(),
    )
}

pub fn decode_fields(fields: &Map<String, Value>) -> FieldMap {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), decode_value(v)))
        .collect()
}

/// Plain JSON to a Firestore typed value.
pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => json!({ "integerValue": i.to_string() }),
            (None, Some(u)) => json!({ "integerValue": u.to_string() }),
            _ => json!({ "doubleValue": n.as_f64().unwrap_or_default() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => {
            json!({ "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() } })
        }
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

/// Firestore typed value to plain JSON. Timestamps, references and bytes come
/// back as strings; geo points as `{latitude, longitude}` objects.
pub fn decode_value(value: &Value) -> Value {
    let Some((kind, inner)) = value.as_object().and_then(|m| m.iter().next()) else {
        return Value::Null;
    };
    match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" => Value::Bool(inner.as_bool().unwrap_or_default()),
        "integerValue" => match inner {
            Value::String(s) => s
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(s.clone())),
            other => other.clone(),
        },
        "doubleValue" => match inner {
            Value::Number(_) => inner.clone(),
            Value::String(s) => s
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(s.clone())),
            _ => Value::Null,
        },
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner.clone(),
        "geoPointValue" => inner.clone(),
        "arrayValue" => Value::Array(
            inner
                .get("values")
                .and_then(Value::as_array)
                .map(|values| values.iter().map(decode_value).collect())
                .unwrap_or_default(),
        ),
        "mapValue" => Value::Object(
            inner
                .get("fields")
                .and_then(Value::as_object)
                .map(decode_fields)
                .unwrap_or_default(),
        ),
        _ => Value::Null,
    }
}
