use anyhow::Result;
use clap::{Parser, Subcommand};
use npe_sync::jobs::{
    run_export_job, run_merge_job, run_sitemap_job, run_sync_job, run_upload_job, JobContext,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "npe-cli")]
#[command(about = "National Parks Explorer catalog maintenance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a named backfill job from catalog.yaml
    Sync { job: String },
    /// Merge the attribute file onto the base catalog file
    Merge,
    /// Regenerate the sitemap from the store
    Sitemap,
    /// Write a collection to <exchange_dir>/<collection>.json
    Export { collection: String },
    /// Merge-write <exchange_dir>/<collection>.json into the store
    Upload { collection: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let ctx = JobContext::from_env()?;

    match cli.command {
        Commands::Sync { job } => {
            let store = ctx.open_store().await?;
            let summary = run_sync_job(&ctx, store.as_ref(), &job).await?;
            let report = &summary.report;
            println!(
                "sync complete: job={} run_id={} scanned={} updated={} unchanged={} skipped={} failed={} report={}",
                summary.job,
                summary.run_id,
                report.scanned,
                report.updated,
                report.unchanged,
                report.skipped,
                report.failed,
                summary.reports_dir.display()
            );
        }
        Commands::Merge => {
            let summary = run_merge_job(&ctx).await?;
            println!(
                "merge complete: records={} matched={} unmatched={} output={}",
                summary.records,
                summary.matched,
                summary.unmatched,
                summary.output.display()
            );
        }
        Commands::Sitemap => {
            let store = ctx.open_store().await?;
            let artifact = run_sitemap_job(&ctx, store.as_ref()).await?;
            println!(
                "sitemap complete: urls={} static={} unchanged={} path={}",
                artifact.url_count,
                artifact.static_count,
                artifact.unchanged,
                artifact.path.display()
            );
        }
        Commands::Export { collection } => {
            let store = ctx.open_store().await?;
            let summary = run_export_job(&ctx, store.as_ref(), &collection).await?;
            println!(
                "export complete: collection={} records={} path={}",
                summary.collection,
                summary.records,
                summary.path.display()
            );
        }
        Commands::Upload { collection } => {
            let store = ctx.open_store().await?;
            let summary = run_upload_job(&ctx, store.as_ref(), &collection).await?;
            println!(
                "upload complete: collection={} uploaded={} failed={}",
                summary.collection, summary.uploaded, summary.failed
            );
        }
    }

    Ok(())
}
