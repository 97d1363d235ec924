//! ArcGIS REST feature service querying.

pub mod client;
pub mod esri;
pub mod pager;
pub mod response;

pub use client::{LayerClient, QuerySpec};
pub use esri::{EsriGeometry, SpatialReference};
pub use pager::{
    LayerQuery, PageSource, Pager, PagerConfig, PagerStats, ProgressSink, QueryProgress,
    RetryPolicy,
};
pub use response::{LayerInfo, RequestError, ResponseFormat, DEFAULT_ID_FIELD};

use crate::models::FeatureRecord;

/// One batch of records returned for a single request
#[derive(Debug, Clone)]
pub struct Page {
    pub offset: u64,
    pub records: Vec<FeatureRecord>,
    pub exceeded_transfer_limit: bool,
}
