//! Boundfetch - download every ArcGIS feature service record that relates
//! spatially to a boundary polygon.
//!
//! This library provides the loader, reprojection, query encoding, paging
//! and output stages used by the `boundfetch` binary.

pub mod arcgis;
pub mod assemble;
pub mod error;
pub mod geometry;
pub mod models;
pub mod pipeline;

pub use error::{FetchError, FetchResult, Stage};
pub use models::{BoundaryGeometry, Crs, FeatureRecord, ResultSet, SpatialRelationship};
pub use pipeline::{run, run_batch, Job, PipelineConfig, RunReport};
