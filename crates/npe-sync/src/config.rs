//! `catalog.yaml`: the single configuration file every batch job reads.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::merge::DuplicatePolicy;
use crate::plan::{Compute, FieldRule};

pub const CONFIG_FILE_NAME: &str = "catalog.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    pub site_origin: String,
    #[serde(default)]
    pub static_routes: Vec<String>,
    pub store: StoreConfig,
    #[serde(default)]
    pub sitemap: SitemapConfig,
    #[serde(default)]
    pub jobs: BTreeMap<String, SyncJobConfig>,
    #[serde(default)]
    pub merge: Option<MergeJobConfig>,
    /// Directory holding `<collection>.json` files for export and upload.
    #[serde(default = "default_exchange_dir")]
    pub exchange_dir: PathBuf,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    Directory {
        root: PathBuf,
    },
    Firestore {
        #[serde(default = "default_credentials")]
        credentials: PathBuf,
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default)]
        database: Option<String>,
        #[serde(default)]
        page_size: Option<u32>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SitemapConfig {
    #[serde(default = "default_sitemap_output")]
    pub output: PathBuf,
    #[serde(default)]
    pub collections: Vec<SitemapCollection>,
}

impl Default for SitemapConfig {
    fn default() -> Self {
        Self {
            output: default_sitemap_output(),
            collections: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SitemapCollection {
    pub collection: String,
    pub route_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncJobConfig {
    pub collection: String,
    pub fields: Vec<FieldRule>,
    #[serde(default)]
    pub lookup: Option<LookupConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LookupConfig {
    pub path: PathBuf,
    /// Key column in the lookup file.
    pub key_column: String,
    /// Record field matched against the key column.
    pub join_field: String,
    #[serde(default)]
    pub duplicates: DuplicatePolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeJobConfig {
    pub base: PathBuf,
    pub attributes: PathBuf,
    pub join_key: String,
    /// Key column in the attribute file; defaults to `join_key`.
    #[serde(default)]
    pub key_column: Option<String>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub duplicates: DuplicatePolicy,
    pub output: PathBuf,
}

fn default_credentials() -> PathBuf {
    PathBuf::from("serviceAccountKey.json")
}

fn default_sitemap_output() -> PathBuf {
    PathBuf::from("public/sitemap.xml")
}

fn default_exchange_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("reports")
}

impl CatalogConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).context("parsing catalog config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(CONFIG_FILE_NAME);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.site_origin.trim().is_empty() {
            bail!("site_origin must not be empty");
        }
        for (name, job) in &self.jobs {
            if job.fields.is_empty() {
                bail!("job {name} has no field rules");
            }
            let needs_lookup = job
                .fields
                .iter()
                .any(|r| matches!(r.compute, Compute::Lookup { .. }));
            if needs_lookup && job.lookup.is_none() {
                bail!("job {name} uses lookup rules but has no lookup table");
            }
        }
        Ok(())
    }

    pub fn job(&self, name: &str) -> Result<&SyncJobConfig> {
        self.jobs.get(name).with_context(|| {
            format!(
                "unknown job {name:?}; configured jobs: {}",
                self.jobs.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
site_origin: https://www.nationalparksexplorerusa.com
static_routes: ["", about, calendar, blog, signup, login, account]
store:
  backend: firestore
sitemap:
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
    lookup:
      path: parks_update_full.csv
      key_column: id
      join_field: parkCode
    fields:
      - { field: entryFee, compute: { lookup: { column: entryFee } }, overwrite: true }
merge:
  base: parks_repaired.json
  attributes: all_park_thumbnails.json
  join_key: parkCode
  columns: [thumbnailUrl]
  output: parks_with_thumbnails.json
"#;

    #[test]
    fn sample_config_parses_with_defaults() {
        let config = CatalogConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.static_routes.len(), 7);
        assert_eq!(config.static_routes[0], "");
        assert_eq!(config.sitemap.output, PathBuf::from("public/sitemap.xml"));
        assert_eq!(config.sitemap.collections[1].route_prefix, "blog");
        match &config.store {
            StoreConfig::Firestore { credentials, .. } => {
                assert_eq!(credentials, &PathBuf::from("serviceAccountKey.json"))
            }
            other => panic!("unexpected store {other:?}"),
        }
        let job = config.job("park-slugs").unwrap();
        assert_eq!(
            job.fields[0].compute,
            Compute::Slug {
                source: "name".into()
            }
        );
        let merge = config.merge.as_ref().unwrap();
        assert_eq!(merge.duplicates, DuplicatePolicy::Reject);
        assert_eq!(merge.columns.as_deref(), Some(&["thumbnailUrl".to_string()][..]));
    }

    #[test]
    fn unknown_job_lists_known_ones() {
        let config = CatalogConfig::from_yaml_str(SAMPLE).unwrap();
        let err = config.job("nope").unwrap_err().to_string();
        assert!(err.contains("park-slugs"));
    }

    #[test]
    fn shipped_catalog_is_valid() {
        let config = CatalogConfig::from_yaml_str(include_str!("../../../catalog.yaml")).unwrap();
        assert_eq!(config.site_origin, "https://www.nationalparksexplorerusa.com");
        for name in ["park-slugs", "blog-slugs", "park-defaults", "park-csv-update", "entry-fee-cleanup"] {
            assert!(config.job(name).is_ok(), "{name}");
        }
        assert!(config.merge.is_some());
    }

    #[test]
    fn lookup_rules_require_a_table() {
        let text = r#"
site_origin: https://x.test
store: { backend: directory, root: data }
jobs:
  broken:
    collection: parks
    fields:
      - { field: hours, compute: { lookup: { column: hours } } }
"#;
        let err = CatalogConfig::from_yaml_str(text).unwrap_err();
        assert!(err.to_string().contains("lookup"));
    }
}
