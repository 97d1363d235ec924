//! Serialize a result set to an output geometry file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use geojson::{FeatureCollection, JsonObject};
use tracing::{debug, info};

use crate::error::{FetchError, FetchResult};
use crate::models::ResultSet;

/// Output file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// One GeoJSON FeatureCollection
    GeoJson,
    /// Newline-delimited GeoJSON features
    GeoJsonSeq,
}

impl OutputFormat {
    pub fn from_path(path: &Path) -> FetchResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match ext.as_deref() {
            Some("geojson") | Some("json") => Ok(OutputFormat::GeoJson),
            Some("geojsonl") | Some("geojsons") | Some("ndjson") => Ok(OutputFormat::GeoJsonSeq),
            other => Err(FetchError::Serialization {
                path: path.to_path_buf(),
                unwritten: 0,
                cause: format!(
                    "unsupported output extension '{}' (use .geojson, .json, .geojsonl or .ndjson)",
                    other.unwrap_or("")
                ),
            }),
        }
    }
}

/// What ended up on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblySummary {
    pub path: PathBuf,
    pub format: OutputFormat,
    pub features: usize,
    pub without_geometry: usize,
    pub bytes: u64,
}

/// Write every record of `results` to `path`.
///
/// The file is written beside the target and renamed into place, so a
/// failure never leaves a partial output behind.
pub fn assemble(
    results: ResultSet,
    path: &Path,
    format: OutputFormat,
) -> FetchResult<AssemblySummary> {
    if results.is_empty() {
        return Err(FetchError::EmptyResult);
    }

    let count = results.len();
    let serialization_err = |cause: String| FetchError::Serialization {
        path: path.to_path_buf(),
        unwritten: count,
        cause,
    };

    let without_geometry = results.iter().filter(|r| r.geometry.is_none()).count();
    if without_geometry > 0 {
        debug!("{} records have no geometry", without_geometry);
    }

    let temp_path = temp_sibling(path);
    let written = write_records(&results, &temp_path, format).and_then(|bytes| {
        std::fs::rename(&temp_path, path)?;
        Ok(bytes)
    });

    let bytes = match written {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = std::fs::remove_file(&temp_path);
            return Err(serialization_err(e.to_string()));
        }
    };

    info!(
        "Wrote {} features to {} ({} bytes)",
        count,
        path.display(),
        bytes
    );

    Ok(AssemblySummary {
        path: path.to_path_buf(),
        format,
        features: count,
        without_geometry,
        bytes,
    })
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}

fn write_records(results: &ResultSet, path: &Path, format: OutputFormat) -> std::io::Result<u64> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    match format {
        OutputFormat::GeoJson => {
            let collection = FeatureCollection {
                bbox: None,
                features: results.iter().map(|r| r.to_geojson()).collect(),
                foreign_members: Some(JsonObject::from_iter([(
                    "numberMatched".to_string(),
                    serde_json::Value::from(results.len()),
                )])),
            };
            serde_json::to_writer_pretty(&mut writer, &collection)?;
            writer.write_all(b"\n")?;
        }
        OutputFormat::GeoJsonSeq => {
            for record in results.iter() {
                serde_json::to_writer(&mut writer, &record.to_geojson())?;
                writer.write_all(b"\n")?;
            }
        }
    }

    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}
