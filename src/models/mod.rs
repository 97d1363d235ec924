//! Core data models for boundary-filtered retrieval.

pub mod boundary;
pub mod feature;
pub mod relationship;
pub mod result_set;

pub use boundary::{BoundaryGeometry, Crs, WGS84};
pub use feature::{AttributeValue, FeatureGeometry, FeatureId, FeatureRecord};
pub use relationship::SpatialRelationship;
pub use result_set::ResultSet;
