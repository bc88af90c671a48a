//! Batch jobs wired from `catalog.yaml`: sync, merge, sitemap, export, upload.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use npe_adapters::{read_attribute_rows, read_field_maps, read_records, write_field_maps};
use npe_core::FieldMap;
use npe_storage::{DirectoryStore, FirestoreConfig, FirestoreCredentials, FirestoreStore, RecordStore};
use serde::Serialize;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{CatalogConfig, StoreConfig};
use crate::merge::{merge_with_stats, AttributeTable};
use crate::plan::FieldPlan;
use crate::sitemap::{write_sitemap, SitemapArtifact, SitemapBuilder};
use crate::{RecordFailure, SyncReport, Synchronizer};

pub const WORKSPACE_ROOT_ENV: &str = "NPE_WORKSPACE_ROOT";
pub const FIRESTORE_TOKEN_ENV: &str = "NPE_FIRESTORE_TOKEN";
pub const FIRESTORE_BASE_URL_ENV: &str = "NPE_FIRESTORE_BASE_URL";

/// Loaded configuration plus the directory relative paths resolve against.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub workspace_root: PathBuf,
    pub config: CatalogConfig,
}

impl JobContext {
    pub fn from_env() -> Result<Self> {
        let root = std::env::var(WORKSPACE_ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self::load(root)
    }

    pub fn load(workspace_root: impl Into<PathBuf>) -> Result<Self> {
        let workspace_root = workspace_root.into();
        let config = CatalogConfig::load(&workspace_root)?;
        Ok(Self {
            workspace_root,
            config,
        })
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    /// Open the configured backend. Credentials and reachability problems
    /// surface here, before any record is touched.
    pub async fn open_store(&self) -> Result<Box<dyn RecordStore>> {
        match &self.config.store {
            StoreConfig::Directory { root } => {
                let store = DirectoryStore::open(self.resolve(root)).await?;
                Ok(Box::new(store))
            }
            StoreConfig::Firestore {
                credentials,
                base_url,
                database,
                page_size,
            } => {
                let credentials = FirestoreCredentials::load(&self.resolve(credentials))?;
                let token = std::env::var(FIRESTORE_TOKEN_ENV)
                    .ok()
                    .filter(|t| !t.trim().is_empty())
                    .or(credentials.access_token);
                let Some(token) = token else {
                    bail!("no Firestore access token: set {FIRESTORE_TOKEN_ENV} or access_token in the credential file");
                };

                let mut config = FirestoreConfig::new(credentials.project_id, token);
                if let Ok(url) = std::env::var(FIRESTORE_BASE_URL_ENV) {
                    config.base_url = url;
                } else if let Some(url) = base_url {
                    config.base_url = url.clone();
                }
                if let Some(database) = database {
                    config.database = database.clone();
                }
                if let Some(page_size) = page_size {
                    config.page_size = *page_size;
                }
                Ok(Box::new(FirestoreStore::new(config)?))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncJobSummary {
    pub run_id: Uuid,
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub report: SyncReport,
    pub reports_dir: PathBuf,
}

/// Run the named sync job and write its run report.
pub async fn run_sync_job(ctx: &JobContext, store: &dyn RecordStore, job_name: &str) -> Result<SyncJobSummary> {
    let job = ctx.config.job(job_name)?;
    let mut plan = FieldPlan::new(job.fields.clone());
    if let Some(lookup) = &job.lookup {
        let path = ctx.resolve(&lookup.path);
        let rows = read_attribute_rows(&path)?;
        let table = AttributeTable::from_rows(rows, &lookup.key_column, None, lookup.duplicates)
            .with_context(|| format!("indexing {}", path.display()))?;
        info!(rows = table.len(), path = %path.display(), "loaded lookup table");
        plan = plan.with_lookup(&lookup.join_field, table);
    }

    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    let report = Synchronizer::new(store)
        .run(&job.collection, &plan)
        .await
        .with_context(|| format!("running job {job_name}"))?;
    let finished_at = Utc::now();

    let summary = SyncJobSummary {
        run_id,
        job: job_name.to_string(),
        started_at,
        finished_at,
        report,
        reports_dir: ctx.resolve(&ctx.config.reports_dir).join(run_id.to_string()),
    };
    write_run_report(&summary).await?;
    Ok(summary)
}

async fn write_run_report(summary: &SyncJobSummary) -> Result<()> {
    let reports_dir = &summary.reports_dir;
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing sync report")?;
    fs::write(reports_dir.join("sync_report.json"), json)
        .await
        .context("writing sync_report.json")?;

    let report = &summary.report;
    let mut markdown = format!(
        "# Sync run {}\n\n- Job: `{}`\n- Collection: `{}`\n- Started: {}\n- Finished: {}\n\n| scanned | updated | unchanged | skipped | failed |\n|---|---|---|---|---|\n| {} | {} | {} | {} | {} |\n",
        summary.run_id,
        summary.job,
        report.collection,
        summary.started_at,
        summary.finished_at,
        report.scanned,
        report.updated,
        report.unchanged,
        report.skipped,
        report.failed,
    );
    if !report.skipped_fields.is_empty() {
        markdown.push_str("\n## Skipped fields\n");
        for skip in &report.skipped_fields {
            markdown.push_str(&format!("- {} `{}`: {}\n", skip.id, skip.field, skip.reason));
        }
    }
    if !report.failures.is_empty() {
        markdown.push_str("\n## Failed writes\n");
        for failure in &report.failures {
            markdown.push_str(&format!("- {}: {}\n", failure.id, failure.message));
        }
    }
    fs::write(reports_dir.join("summary.md"), markdown)
        .await
        .context("writing summary.md")?;

    Ok(())
}

/// Stream every configured collection into the sitemap and write it.
pub async fn run_sitemap_job(ctx: &JobContext, store: &dyn RecordStore) -> Result<SitemapArtifact> {
    let config = &ctx.config;
    let mut builder = SitemapBuilder::new(&config.site_origin);
    for route in &config.static_routes {
        builder.push_static(route);
    }
    let static_count = builder.urls().len();

    for entry in &config.sitemap.collections {
        let mut stream = store
            .stream(&entry.collection)
            .await
            .with_context(|| format!("reading {}", entry.collection))?;
        let mut added = 0usize;
        let mut passed_over = 0usize;
        while let Some(record) = stream.next_record().await? {
            if builder.push_record(&entry.route_prefix, &record) {
                added += 1;
            } else {
                passed_over += 1;
            }
        }
        info!(collection = %entry.collection, added, passed_over, "collected sitemap urls");
    }

    let urls = builder.finish();
    let artifact = write_sitemap(&ctx.resolve(&config.sitemap.output), &urls, static_count).await?;
    info!(
        path = %artifact.path.display(),
        urls = artifact.url_count,
        unchanged = artifact.unchanged,
        "sitemap written"
    );
    Ok(artifact)
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeJobSummary {
    pub output: PathBuf,
    pub records: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub unchanged: bool,
}

pub async fn run_merge_job(ctx: &JobContext) -> Result<MergeJobSummary> {
    let Some(job) = &ctx.config.merge else {
        bail!("no merge job configured in {}", crate::config::CONFIG_FILE_NAME);
    };
    let base = read_field_maps(ctx.resolve(&job.base))?;
    let attributes_path = ctx.resolve(&job.attributes);
    let rows = read_attribute_rows(&attributes_path)?;
    let key_column = job.key_column.as_deref().unwrap_or(&job.join_key);
    let table = AttributeTable::from_rows(rows, key_column, job.columns.as_deref(), job.duplicates)
        .with_context(|| format!("indexing {}", attributes_path.display()))?;

    let outcome = merge_with_stats(base, &table, &job.join_key);
    let stored = write_field_maps(ctx.resolve(&job.output), &outcome.records).await?;
    info!(
        matched = outcome.matched,
        unmatched = outcome.unmatched,
        path = %stored.path.display(),
        "merge written"
    );
    Ok(MergeJobSummary {
        output: stored.path,
        records: outcome.records.len(),
        matched: outcome.matched,
        unmatched: outcome.unmatched,
        unchanged: stored.unchanged,
    })
}

fn exchange_path(ctx: &JobContext, collection: &str) -> PathBuf {
    ctx.resolve(&ctx.config.exchange_dir)
        .join(format!("{collection}.json"))
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub collection: String,
    pub path: PathBuf,
    pub records: usize,
    pub unchanged: bool,
}

/// Dump a collection as `[{ "id": ..., ...fields }]`.
pub async fn run_export_job(ctx: &JobContext, store: &dyn RecordStore, collection: &str) -> Result<ExportSummary> {
    let mut stream = store
        .stream(collection)
        .await
        .with_context(|| format!("reading {collection}"))?;
    let mut documents: Vec<FieldMap> = Vec::new();
    while let Some(record) = stream.next_record().await? {
        documents.push(record.to_document());
    }
    let stored = write_field_maps(exchange_path(ctx, collection), &documents).await?;
    info!(collection, records = documents.len(), path = %stored.path.display(), "export written");
    Ok(ExportSummary {
        collection: collection.to_string(),
        path: stored.path,
        records: documents.len(),
        unchanged: stored.unchanged,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSummary {
    pub collection: String,
    pub source: PathBuf,
    pub uploaded: usize,
    pub failed: usize,
    pub failures: Vec<RecordFailure>,
}

/// Merge-write every record of `<exchange_dir>/<collection>.json`.
pub async fn run_upload_job(ctx: &JobContext, store: &dyn RecordStore, collection: &str) -> Result<UploadSummary> {
    let source = exchange_path(ctx, collection);
    let records = read_records(&source)?;
    let mut summary = UploadSummary {
        collection: collection.to_string(),
        source,
        uploaded: 0,
        failed: 0,
        failures: Vec::new(),
    };
    for record in &records {
        match store.upsert(collection, record).await {
            Ok(()) => summary.uploaded += 1,
            Err(err) => {
                warn!(id = %record.id, "upload failed: {err}");
                summary.failed += 1;
                summary.failures.push(RecordFailure {
                    id: record.id.clone(),
                    message: err.to_string(),
                });
            }
        }
    }
    info!(collection, uploaded = summary.uploaded, failed = summary.failed, "upload finished");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use npe_storage::MemoryStore;
    use serde_json::{json, Value};
    use tempfile::{tempdir, TempDir};

    const CATALOG: &str = r#"
site_origin: https://parks.test/
static_routes: ["", about]
store: { backend: directory, root: data }
sitemap:
  output: public/sitemap.xml
  collections:
    - { collection: parks, route_prefix: park }
    - { collection: blogs, route_prefix: blog }
jobs:
  park-slugs:
    collection: parks
    fields:
      - { field: slug, compute: { slug: { source: name } } }
  park-csv-update:
    collection: parks
    lookup: { path: parks_update.csv, key_column: id, join_field: parkCode }
    fields:
      - { field: hours, compute: { lookup: { column: hours } }, overwrite: true }
merge:
  base: parks_repaired.json
  attributes: all_park_thumbnails.json
  join_key: parkCode
  columns: [thumbnailUrl]
  output: parks_with_thumbnails.json
exchange_dir: exchange
"#;

    fn workspace() -> TempDir {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("catalog.yaml"), CATALOG).unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(
            dir.path().join("data/parks.json"),
            json!([
                {"id": "p1", "name": "Zion National Park", "parkCode": "zion"},
                {"id": "p2", "name": "Acadia", "slug": "acadia", "parkCode": "acad"},
                {"id": "p3", "name": "???", "parkCode": "none"}
            ])
            .to_string(),
        )
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn sync_job_writes_slugs_and_a_run_report() {
        let dir = workspace();
        let ctx = JobContext::load(dir.path()).unwrap();
        let store = ctx.open_store().await.unwrap();

        let summary = run_sync_job(&ctx, store.as_ref(), "park-slugs").await.unwrap();
        assert_eq!(summary.report.updated, 1);
        assert_eq!(summary.report.skipped, 1);
        assert!(summary.reports_dir.join("sync_report.json").is_file());
        let markdown = std::fs::read_to_string(summary.reports_dir.join("summary.md")).unwrap();
        assert!(markdown.contains("park-slugs"));
        assert!(markdown.contains("p3"));

        let parks: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("data/parks.json")).unwrap()).unwrap();
        assert_eq!(parks[0]["slug"], json!("zion-national-park"));

        let again = run_sync_job(&ctx, store.as_ref(), "park-slugs").await.unwrap();
        assert_eq!(again.report.updated, 0);
        assert_ne!(again.run_id, summary.run_id);
    }

    #[tokio::test]
    async fn csv_lookup_job_overwrites_from_rows() {
        let dir = workspace();
        std::fs::write(dir.path().join("parks_update.csv"), "id,hours\nzion,24/7\nacad,6am-10pm\n").unwrap();
        let ctx = JobContext::load(dir.path()).unwrap();
        let store = ctx.open_store().await.unwrap();

        let summary = run_sync_job(&ctx, store.as_ref(), "park-csv-update").await.unwrap();
        assert_eq!(summary.report.updated, 2);
        assert_eq!(summary.report.skipped, 1);
    }

    #[tokio::test]
    async fn missing_lookup_file_fails_before_any_write() {
        let dir = workspace();
        let ctx = JobContext::load(dir.path()).unwrap();
        let store = MemoryStore::new();
        let err = run_sync_job(&ctx, &store, "park-csv-update").await.unwrap_err();
        assert!(format!("{err:#}").contains("parks_update.csv"));
        assert!(store.write_log().await.is_empty());
    }

    #[tokio::test]
    async fn sitemap_job_lists_static_routes_then_slugged_records() {
        let dir = workspace();
        std::fs::write(
            dir.path().join("data/blogs.json"),
            json!([{"id": "b1", "slug": "packing-list"}, {"id": "b2", "title": "Draft"}]).to_string(),
        )
        .unwrap();
        let ctx = JobContext::load(dir.path()).unwrap();
        let store = ctx.open_store().await.unwrap();

        let artifact = run_sitemap_job(&ctx, store.as_ref()).await.unwrap();
        assert_eq!(artifact.static_count, 2);
        assert_eq!(artifact.url_count, 4);
        let xml = std::fs::read_to_string(dir.path().join("public/sitemap.xml")).unwrap();
        assert!(xml.contains("<loc>https://parks.test/</loc>"));
        assert!(xml.contains("<loc>https://parks.test/park/acadia</loc>"));
        assert!(xml.contains("<loc>https://parks.test/blog/packing-list</loc>"));

        let again = run_sitemap_job(&ctx, store.as_ref()).await.unwrap();
        assert!(again.unchanged);
    }

    #[tokio::test]
    async fn merge_job_copies_selected_columns() {
        let dir = workspace();
        std::fs::write(
            dir.path().join("parks_repaired.json"),
            json!([{"parkCode": "zion", "name": "Zion"}, {"parkCode": "acad", "name": "Acadia"}]).to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("all_park_thumbnails.json"),
            json!([{"parkCode": "zion", "thumbnailUrl": "z.jpg", "credit": "nps"}]).to_string(),
        )
        .unwrap();
        let ctx = JobContext::load(dir.path()).unwrap();

        let summary = run_merge_job(&ctx).await.unwrap();
        assert_eq!((summary.records, summary.matched, summary.unmatched), (2, 1, 1));
        let merged: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("parks_with_thumbnails.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(
            merged,
            json!([
                {"parkCode": "zion", "name": "Zion", "thumbnailUrl": "z.jpg"},
                {"parkCode": "acad", "name": "Acadia"}
            ])
        );
    }

    #[tokio::test]
    async fn export_then_upload_into_another_store() {
        let dir = workspace();
        let ctx = JobContext::load(dir.path()).unwrap();
        let source = ctx.open_store().await.unwrap();

        let export = run_export_job(&ctx, source.as_ref(), "parks").await.unwrap();
        assert_eq!(export.records, 3);
        assert_eq!(export.path, dir.path().join("exchange/parks.json"));

        let target = MemoryStore::new().rejecting_writes_for("p2");
        let upload = run_upload_job(&ctx, &target, "parks").await.unwrap();
        assert_eq!(upload.uploaded, 2);
        assert_eq!(upload.failed, 1);
        assert_eq!(upload.failures[0].id, "p2");
        let uploaded = target.records("parks").await;
        assert_eq!(uploaded[0].text_field("name"), Some("Zion National Park"));
    }

    #[tokio::test]
    async fn missing_credentials_fail_at_open() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("catalog.yaml"),
            "site_origin: https://parks.test\nstore: { backend: firestore }\n",
        )
        .unwrap();
        let ctx = JobContext::load(dir.path()).unwrap();
        let err = ctx.open_store().await.err().unwrap();
        assert!(err.to_string().contains("serviceAccountKey.json"));
    }
}
