//! Boundary-filtered ArcGIS feature download.
//!
//! Loads a boundary polygon, pages through every feature of a layer that
//! relates to it, and writes the de-duplicated result as GeoJSON.

mod config;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use boundfetch::arcgis::{ProgressSink, QueryProgress, ResponseFormat, RetryPolicy};
use boundfetch::{run_batch, Crs, FetchError, Job, PipelineConfig, SpatialRelationship};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "boundfetch")]
#[command(about = "Download ArcGIS features that relate spatially to a boundary")]
struct Args {
    /// Boundary file (GeoJSON, Shapefile or GeoPackage); without one only
    /// the --where filter applies
    #[arg(short, long)]
    boundary: Option<PathBuf>,

    /// Feature layer URL, with or without the trailing /query
    #[arg(short, long, required_unless_present = "config")]
    service_url: Option<String>,

    /// Spatial relationship between the boundary and each feature
    #[arg(short, long, default_value = "intersects")]
    relationship: String,

    /// Output file (.geojson, .json, .geojsonl or .ndjson)
    #[arg(short, long, required_unless_present = "config")]
    output: Option<PathBuf>,

    /// Attribute filter
    #[arg(long = "where", default_value = "1=1")]
    where_clause: String,

    /// Comma-separated attribute fields to return
    #[arg(long, default_value = "*")]
    out_fields: String,

    /// Records requested per page
    #[arg(long, default_value = "1000")]
    page_size: u32,

    /// CRS of the boundary when the file does not declare one (e.g. EPSG:28356)
    #[arg(long)]
    source_crs: Option<String>,

    /// Boundary format, overriding the file extension
    #[arg(long)]
    format: Option<String>,

    /// Retries per page for transient failures
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Pause between page requests
    #[arg(long, default_value = "500")]
    page_delay_ms: u64,

    /// HTTP request timeout
    #[arg(long, default_value = "60")]
    timeout_secs: u64,

    /// Request f=geojson instead of Esri JSON
    #[arg(long)]
    geojson: bool,

    /// Batch config file with several jobs
    #[arg(short, long, conflicts_with_all = ["boundary", "service_url", "output"])]
    config: Option<PathBuf>,

    /// Jobs run at once in batch mode
    #[arg(long)]
    concurrency: Option<usize>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// One progress bar per job
struct ProgressBars {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl ProgressBars {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn finish(&self) {
        if let Ok(bars) = self.bars.lock() {
            for bar in bars.values() {
                bar.finish();
            }
        }
    }
}

impl ProgressSink for ProgressBars {
    fn on_page(&self, job: &str, progress: &QueryProgress) {
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };
        let bar = bars.entry(job.to_string()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(0));
            let style = ProgressStyle::default_bar()
                .template("{spinner:.green} {prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            bar.set_prefix(job.to_string());
            bar
        });

        if let Some(total) = progress.estimated_total {
            bar.set_length(total.max(progress.records as u64));
        } else {
            bar.set_length(progress.records as u64);
        }
        bar.set_position(progress.records as u64);
        bar.set_message(format!(
            "{} pages, {} retries",
            progress.pages, progress.retries
        ));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Boundfetch");

    let (jobs, concurrency, timeout_secs) = match &args.config {
        Some(path) => {
            let config = Config::load_from_file(path)?;
            let base_dir = path.parent().unwrap_or(Path::new("."));
            let jobs = config.to_jobs(base_dir)?;
            info!("Loaded {} jobs from {}", jobs.len(), path.display());
            (
                jobs,
                args.concurrency.unwrap_or(config.global.concurrency),
                config.global.timeout_secs,
            )
        }
        None => (vec![job_from_args(&args)?], 1, args.timeout_secs),
    };

    for job in &jobs {
        if let Some(boundary) = job.boundary.as_ref().filter(|b| !b.exists()) {
            anyhow::bail!(
                "Boundary file for job '{}' not found: {}",
                job.name,
                boundary.display()
            );
        }
    }

    let http = reqwest::Client::builder()
        .user_agent(concat!("boundfetch/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    // Ctrl-C stops each run before its next request
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current request");
                cancel.cancel();
            }
        });
    }

    let progress = ProgressBars::new();
    let results = run_batch(&http, &jobs, concurrency, &progress, &cancel).await;
    progress.finish();

    let mut failed = 0;
    for (name, result) in &results {
        match result {
            Ok(report) => info!(
                "[{}] {} features -> {} ({} pages, {} retries, {} duplicates, {:.1}s)",
                name,
                report.features,
                report.output.display(),
                report.pages,
                report.retries,
                report.duplicates,
                (report.finished_at - report.started_at).num_milliseconds() as f64 / 1000.0
            ),
            Err(FetchError::EmptyResult) => {
                failed += 1;
                warn!("[{}] No features matched; nothing written", name);
            }
            Err(e) => {
                failed += 1;
                match e.offset() {
                    Some(offset) => {
                        error!("[{}] {} stage failed at offset {}: {}", name, e.stage(), offset, e)
                    }
                    None => error!("[{}] {} stage failed: {}", name, e.stage(), e),
                }
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} jobs failed", failed, results.len());
    }

    Ok(())
}

fn job_from_args(args: &Args) -> Result<Job> {
    let service_url = args
        .service_url
        .clone()
        .context("--service-url is required")?;
    let output = args.output.clone().context("--output is required")?;

    let relationship: SpatialRelationship = args.relationship.parse()?;
    let source_crs = args
        .source_crs
        .as_deref()
        .map(|s| s.parse::<Crs>().map_err(anyhow::Error::msg))
        .transpose()
        .context("Invalid --source-crs")?;

    url::Url::parse(service_url.trim_end_matches("/query"))
        .with_context(|| format!("Invalid --service-url '{}'", service_url))?;

    let mut config = PipelineConfig::new(service_url);
    config.relationship = relationship;
    config.where_clause = args.where_clause.clone();
    config.out_fields = args.out_fields.clone();
    config.page_size = args.page_size;
    config.retry = RetryPolicy {
        max_retries: args.max_retries,
        ..RetryPolicy::default()
    };
    config.page_delay = Duration::from_millis(args.page_delay_ms);
    if args.geojson {
        config.format = ResponseFormat::GeoJson;
    }

    let name = args
        .boundary
        .as_deref()
        .unwrap_or(output.as_path())
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("boundary")
        .to_string();

    Ok(Job {
        name,
        boundary: args.boundary.clone(),
        boundary_format: args.format.clone(),
        source_crs,
        output,
        config,
    })
}
