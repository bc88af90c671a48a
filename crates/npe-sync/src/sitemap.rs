//! Sitemap aggregation and rendering.

use std::path::{Path, PathBuf};

use anyhow::Result;
use npe_core::Record;
use npe_storage::write_file_atomic;
use quick_xml::escape::escape;
use serde::Serialize;

pub const SITEMAP_NAMESPACE: &str = "http://www.sitemaps.org/schemas/sitemap/0.9";

/// Accumulates sitemap URLs in emission order: static routes first, then
/// records of each collection as they are pushed.
#[derive(Debug, Clone)]
pub struct SitemapBuilder {
    origin: String,
    urls: Vec<String>,
}

impl SitemapBuilder {
    pub fn new(origin: &str) -> Self {
        Self {
            origin: origin.trim_end_matches('/').to_string(),
            urls: Vec::new(),
        }
    }

    /// Static routes are used verbatim: `""` becomes `origin/`.
    pub fn push_static(&mut self, route: &str) {
        self.urls.push(format!("{}/{route}", self.origin));
    }

    /// Add `origin/prefix/slug`; records without a slug are not ready to be
    /// indexed and are passed over. Returns whether a URL was added.
    pub fn push_record(&mut self, route_prefix: &str, record: &Record) -> bool {
        match record.slug() {
            Some(slug) => {
                self.urls
                    .push(format!("{}/{route_prefix}/{slug}", self.origin));
                true
            }
            None => false,
        }
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn finish(self) -> Vec<String> {
        self.urls
    }
}

/// Build the full URL list from static routes and `(route_prefix, records)`
/// pairs, in the given order.
pub fn build_sitemap<R, P>(origin: &str, static_routes: &[R], collections: &[(P, Vec<Record>)]) -> Vec<String>
where
    R: AsRef<str>,
    P: AsRef<str>,
{
    let mut builder = SitemapBuilder::new(origin);
    for route in static_routes {
        builder.push_static(route.as_ref());
    }
    for (prefix, records) in collections {
        for record in records {
            builder.push_record(prefix.as_ref(), record);
        }
    }
    builder.finish()
}

pub fn render_sitemap_xml(urls: &[String]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(&format!("<urlset xmlns=\"{SITEMAP_NAMESPACE}\">\n"));
    for url in urls {
        xml.push_str(&format!("  <url><loc>{}</loc></url>\n", escape(url.as_str())));
    }
    xml.push_str("</urlset>\n");
    xml
}

#[derive(Debug, Clone, Serialize)]
pub struct SitemapArtifact {
    pub path: PathBuf,
    pub url_count: usize,
    pub static_count: usize,
    pub content_hash: String,
    /// The file on disk already matched and was not rewritten.
    pub unchanged: bool,
}

pub async fn write_sitemap(path: &Path, urls: &[String], static_count: usize) -> Result<SitemapArtifact> {
    let xml = render_sitemap_xml(urls);
    let stored = write_file_atomic(path, xml.as_bytes()).await?;
    Ok(SitemapArtifact {
        path: stored.path,
        url_count: urls.len(),
        static_count,
        content_hash: stored.content_hash,
        unchanged: stored.unchanged,
    })
}
