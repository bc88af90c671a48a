//! Idempotent backfill synchronization, catalog merging and sitemap generation.

use npe_storage::{RecordStore, StoreError};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

pub mod config;
pub mod jobs;
pub mod merge;
pub mod plan;
pub mod sitemap;

pub use config::{CatalogConfig, StoreConfig};
pub use jobs::JobContext;
pub use merge::{merge, merge_with_stats, AttributeTable, DuplicatePolicy, MergeError, MergeOutcome};
pub use plan::{Compute, FieldPlan, FieldRule, SkipReason};
pub use sitemap::{build_sitemap, render_sitemap_xml, SitemapArtifact, SitemapBuilder};

pub const CRATE_NAME: &str = "npe-sync";

/// A field that could not be computed for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedField {
    pub id: String,
    pub field: String,
    pub reason: SkipReason,
}

/// A record whose partial update was rejected by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub id: String,
    pub message: String,
}

/// Outcome of one synchronizer pass. Every scanned record lands in exactly one
/// of `updated`, `unchanged`, `skipped` or `failed`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub collection: String,
    pub scanned: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Records with nothing to write because every pending field was skipped.
    pub skipped: usize,
    pub failed: usize,
    pub skipped_fields: Vec<SkippedField>,
    pub failures: Vec<RecordFailure>,
}

impl SyncReport {
    fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            ..Default::default()
        }
    }

    /// Nothing was written and nothing failed.
    pub fn is_noop(&self) -> bool {
        self.updated == 0 && self.failed == 0
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{}: scanned={} updated={} unchanged={} skipped={} failed={}",
            self.collection, self.scanned, self.updated, self.unchanged, self.skipped, self.failed
        )
    }
}

/// Applies a [`FieldPlan`] to every record of a collection, one forward pass,
/// one partial update per record that needs one.
pub struct Synchronizer<'a> {
    store: &'a dyn RecordStore,
}

impl<'a> Synchronizer<'a> {
    pub fn new(store: &'a dyn RecordStore) -> Self {
        Self { store }
    }

    /// Only a store that cannot be opened or read aborts the pass; rejected
    /// writes are recorded in the report.
    pub async fn run(&self, collection: &str, plan: &FieldPlan) -> Result<SyncReport, StoreError> {
        let span = info_span!("sync", collection, backend = self.store.backend_name());
        self.run_pass(collection, plan).instrument(span).await
    }

    async fn run_pass(&self, collection: &str, plan: &FieldPlan) -> Result<SyncReport, StoreError> {
        let mut stream = self.store.stream(collection).await?;
        let mut report = SyncReport::new(collection);

        while let Some(record) = stream.next_record().await? {
            report.scanned += 1;
            let planned = plan.evaluate(&record);

            for (field, reason) in &planned.skipped {
                warn!(id = %record.id, field = %field, "skipped: {reason}");
            }
            let had_skips = !planned.skipped.is_empty();
            report
                .skipped_fields
                .extend(planned.skipped.into_iter().map(|(field, reason)| SkippedField {
                    id: record.id.clone(),
                    field,
                    reason,
                }));

            if planned.updates.is_empty() {
                if had_skips {
                    report.skipped += 1;
                } else {
                    report.unchanged += 1;
                }
                continue;
            }

            match self
                .store
                .update_fields(collection, &record.id, &planned.updates)
                .await
            {
                Ok(()) => {
                    let fields = planned.updates.keys().cloned().collect::<Vec<_>>().join(",");
                    info!(id = %record.id, fields = %fields, "updated");
                    report.updated += 1;
                }
                Err(err) => {
                    warn!(id = %record.id, "write failed: {err}");
                    report.failed += 1;
                    report.failures.push(RecordFailure {
                        id: record.id.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }

        info!("{}", report.summary_line());
        Ok(report)
    }
}
