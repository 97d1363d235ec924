//! End-to-end runs: load, reproject, encode, page through the layer and
//! write the results.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::arcgis::{
    LayerClient, LayerQuery, Pager, PagerConfig, ProgressSink, QuerySpec, ResponseFormat,
    RetryPolicy,
};
use crate::assemble::{assemble, OutputFormat};
use crate::error::FetchResult;
use crate::geometry::{encode, load_boundary, reproject, BoundaryFormat, QueryGeometry};
use crate::models::{Crs, SpatialRelationship, WGS84};

/// Query settings for one run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Layer URL, with or without the trailing `/query`
    pub service_url: String,
    pub relationship: SpatialRelationship,
    pub where_clause: String,
    pub out_fields: String,
    pub page_size: u32,
    /// CRS the boundary is sent in (`inSR`)
    pub query_crs: Crs,
    /// CRS of returned geometries (`outSR`)
    pub out_crs: Crs,
    pub format: ResponseFormat,
    pub retry: RetryPolicy,
    pub page_delay: Duration,
    /// Read `maxRecordCount`, the id field and pagination support first
    pub read_layer_info: bool,
    /// Ask for the matching count before paging
    pub count_first: bool,
    /// Identifier attribute; layer metadata or the response decide when unset
    pub id_field: Option<String>,
}

impl PipelineConfig {
    pub fn new(service_url: impl Into<String>) -> Self {
        Self {
            service_url: service_url.into(),
            relationship: SpatialRelationship::Intersects,
            where_clause: "1=1".to_string(),
            out_fields: "*".to_string(),
            page_size: 1000,
            query_crs: WGS84,
            out_crs: WGS84,
            format: ResponseFormat::Json,
            retry: RetryPolicy::default(),
            page_delay: Duration::from_millis(500),
            read_layer_info: true,
            count_first: true,
            id_field: None,
        }
    }
}

/// One boundary file to fetch features for
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    /// Without a boundary the layer is filtered by `where` alone
    pub boundary: Option<PathBuf>,
    /// Overrides extension sniffing
    pub boundary_format: Option<String>,
    /// Overrides the CRS declared in the boundary file
    pub source_crs: Option<Crs>,
    pub output: PathBuf,
    pub config: PipelineConfig,
}

/// Summary of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub features: usize,
    pub pages: usize,
    pub retries: u32,
    pub throttled: u32,
    pub duplicates: usize,
    pub estimated_total: Option<u64>,
    pub output: PathBuf,
    pub bytes: u64,
}

/// Run one job to completion.
///
/// Everything up to the encoded query geometry is checked before the first
/// request, so a bad boundary never touches the network. A job without a
/// boundary skips those stages and sends no spatial filter. A failed run
/// writes no output.
pub async fn run(
    http: &Client,
    job: &Job,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> FetchResult<RunReport> {
    let started_at = Utc::now();
    let config = &job.config;

    let output_format = OutputFormat::from_path(&job.output)?;
    let client = LayerClient::new(http.clone(), &config.service_url)?;
    let geometry = match &job.boundary {
        Some(path) => Some(query_geometry(job, path)?),
        None => {
            info!(
                "[{}] No boundary, querying by attributes only: {}",
                job.name, config.where_clause
            );
            None
        }
    };

    let mut pager_config = PagerConfig {
        page_size: config.page_size.max(1),
        retry: config.retry.clone(),
        page_delay: config.page_delay,
        paginate: true,
    };
    let mut id_field = config.id_field.clone();

    if config.read_layer_info {
        match client.layer_info().await {
            Ok(layer) => {
                info!(
                    "[{}] Layer '{}' ({})",
                    job.name,
                    layer.name.as_deref().unwrap_or("unnamed"),
                    layer.geometry_type.as_deref().unwrap_or("no geometry type")
                );
                if let Some(max) = layer.max_record_count.filter(|&m| m > 0) {
                    if max < pager_config.page_size {
                        info!(
                            "[{}] Clamping page size {} to layer maxRecordCount {}",
                            job.name, pager_config.page_size, max
                        );
                        pager_config.page_size = max;
                    }
                }
                if id_field.is_none() {
                    id_field = layer.id_field().map(str::to_string);
                }
                if !layer.supports_pagination() {
                    warn!(
                        "[{}] Layer does not support pagination, making one unpaged request",
                        job.name
                    );
                    pager_config.paginate = false;
                }
            }
            Err(e) => warn!(
                "[{}] Layer metadata unavailable, using defaults: {}",
                job.name,
                e.message()
            ),
        }
    }

    let spec = QuerySpec {
        geometry,
        where_clause: config.where_clause.clone(),
        out_fields: config.out_fields.clone(),
        out_crs: config.out_crs,
        format: config.format,
        id_field,
    };

    let estimated_total = if config.count_first {
        match client.count(&spec).await {
            Ok(count) => {
                info!("[{}] Service reports {} matching features", job.name, count);
                Some(count)
            }
            Err(e) => {
                warn!("[{}] Count query failed, total unknown: {}", job.name, e.message());
                None
            }
        }
    } else {
        None
    };

    let source = LayerQuery {
        client: &client,
        spec: &spec,
    };
    let (results, stats) = Pager::new(&source, pager_config)
        .with_cancel(cancel.clone())
        .with_estimated_total(estimated_total)
        .with_job(job.name.clone())
        .run(progress)
        .await?;

    let summary = assemble(results, &job.output, output_format)?;

    Ok(RunReport {
        job: job.name.clone(),
        started_at,
        finished_at: Utc::now(),
        features: summary.features,
        pages: stats.pages,
        retries: stats.retries,
        throttled: stats.throttled,
        duplicates: stats.duplicates,
        estimated_total,
        output: summary.path,
        bytes: summary.bytes,
    })
}

/// Load, reproject and encode the job's boundary
fn query_geometry(job: &Job, path: &Path) -> FetchResult<QueryGeometry> {
    info!("[{}] Boundary: {}", job.name, path.display());

    let format = BoundaryFormat::resolve(path, job.boundary_format.as_deref())?;
    let boundary = load_boundary(path, format, job.source_crs)?;
    let boundary = reproject(&boundary, job.config.query_crs)?;
    let geometry = encode(&boundary, job.config.relationship)?;
    debug!("[{}] Query geometry is {} bytes", job.name, geometry.json().len());
    Ok(geometry)
}

/// Run independent jobs, at most `concurrency` at a time.
///
/// Results come back in input order.
pub async fn run_batch(
    http: &Client,
    jobs: &[Job],
    concurrency: usize,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Vec<(String, FetchResult<RunReport>)> {
    let mut results: Vec<(usize, String, FetchResult<RunReport>)> =
        stream::iter(jobs.iter().enumerate())
            .map(|(i, job)| async move {
                let result = run(http, job, progress, cancel).await;
                (i, job.name.clone(), result)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

    results.sort_by_key(|(i, _, _)| *i);
    results
        .into_iter()
        .map(|(_, name, result)| (name, result))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use std::io::Write;

    fn boundary_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".geojson")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn job(boundary: PathBuf, output: PathBuf, service_url: &str) -> Job {
        Job {
            name: "test".to_string(),
            boundary: Some(boundary),
            boundary_format: None,
            source_crs: None,
            output,
            config: PipelineConfig::new(service_url),
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = PipelineConfig::new("https://example.com/arcgis/rest/services/X/FeatureServer/0");
        assert_eq!(config.where_clause, "1=1");
        assert_eq!(config.out_fields, "*");
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.out_crs, WGS84);
        assert_eq!(config.relationship, SpatialRelationship::Intersects);
    }

    #[tokio::test]
    async fn test_invalid_boundary_fails_before_network() {
        let dir = tempfile::tempdir().unwrap();
        let file = boundary_file(
            r#"{"type":"Feature","properties":{},"geometry":{"type":"Point","coordinates":[1,2]}}"#,
        );
        // Nothing listens here; a request would surface as a query error
        let job = job(
            file.path().to_path_buf(),
            dir.path().join("out.geojson"),
            "http://127.0.0.1:9/arcgis/rest/services/X/FeatureServer/0",
        );

        let err = run(&Client::new(), &job, &(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidGeometry(_)));
    }

    #[tokio::test]
    async fn test_bad_output_extension_rejected_first() {
        let dir = tempfile::tempdir().unwrap();
        let file = boundary_file(
            r#"{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,1],[0,0]]]}"#,
        );
        let job = job(
            file.path().to_path_buf(),
            dir.path().join("out.csv"),
            "http://127.0.0.1:9/arcgis/rest/services/X/FeatureServer/0",
        );

        let err = run(&Client::new(), &job, &(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Serialization { unwritten: 0, .. }));
    }

    #[tokio::test]
    async fn test_unprojectable_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let file = boundary_file(
            r#"{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,1],[0,0]]]}"#,
        );
        let mut job = job(
            file.path().to_path_buf(),
            dir.path().join("out.geojson"),
            "http://127.0.0.1:9/arcgis/rest/services/X/FeatureServer/0",
        );
        job.source_crs = Some(Crs(2193));

        let err = run(&Client::new(), &job, &(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Reprojection(_)));
    }
}
