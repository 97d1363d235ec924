use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use boundfetch::arcgis::{ResponseFormat, RetryPolicy};
use boundfetch::{Crs, Job, PipelineConfig, SpatialRelationship};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub global: GlobalConfig,
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GlobalConfig {
    pub service_url: Option<String>,
    #[serde(default = "default_relationship")]
    pub relationship: String,
    #[serde(default = "default_where", rename = "where")]
    pub where_clause: String,
    #[serde(default = "default_out_fields")]
    pub out_fields: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub geojson: bool,
    /// Outputs of jobs without an explicit `output` land here
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobConfig {
    pub name: String,
    /// Omitted for attribute-only jobs
    pub boundary: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub service_url: Option<String>,
    pub relationship: Option<String>,
    #[serde(rename = "where")]
    pub where_clause: Option<String>,
    pub out_fields: Option<String>,
    pub source_crs: Option<String>,
    pub format: Option<String>,
}

fn default_relationship() -> String {
    "intersects".to_string()
}

fn default_where() -> String {
    "1=1".to_string()
}

fn default_out_fields() -> String {
    "*".to_string()
}

fn default_page_size() -> u32 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_page_delay_ms() -> u64 {
    500
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_concurrency() -> usize {
    2
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Resolve every job against the global defaults. Relative paths are
    /// taken relative to `base_dir` (the config file's directory).
    pub fn to_jobs(&self, base_dir: &Path) -> Result<Vec<Job>> {
        let global = &self.global;
        let resolve = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base_dir.join(p)
            }
        };

        self.jobs
            .iter()
            .map(|job| {
                let service_url = job
                    .service_url
                    .as_ref()
                    .or(global.service_url.as_ref())
                    .with_context(|| format!("job '{}' has no service_url", job.name))?;

                let relationship: SpatialRelationship = job
                    .relationship
                    .as_deref()
                    .unwrap_or(&global.relationship)
                    .parse()
                    .with_context(|| format!("job '{}'", job.name))?;

                let source_crs = job
                    .source_crs
                    .as_deref()
                    .map(|s| s.parse::<Crs>().map_err(anyhow::Error::msg))
                    .transpose()
                    .with_context(|| format!("job '{}' has an invalid source_crs", job.name))?;

                let mut config = PipelineConfig::new(service_url.clone());
                config.relationship = relationship;
                config.where_clause = job
                    .where_clause
                    .clone()
                    .unwrap_or_else(|| global.where_clause.clone());
                config.out_fields = job
                    .out_fields
                    .clone()
                    .unwrap_or_else(|| global.out_fields.clone());
                config.page_size = global.page_size;
                config.retry = RetryPolicy {
                    max_retries: global.max_retries,
                    ..RetryPolicy::default()
                };
                config.page_delay = Duration::from_millis(global.page_delay_ms);
                if global.geojson {
                    config.format = ResponseFormat::GeoJson;
                }

                let output = match &job.output {
                    Some(path) => resolve(path),
                    None => resolve(&global.output_dir).join(format!("{}.geojson", job.name)),
                };

                Ok(Job {
                    name: job.name.clone(),
                    boundary: job.boundary.as_deref().map(resolve),
                    boundary_format: job.format.clone(),
                    source_crs,
                    output,
                    config,
                })
            })
            .collect()
    }
}
