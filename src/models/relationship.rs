//! Spatial relationship operators understood by ArcGIS feature services.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// Topological predicate between a candidate feature and the query polygon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpatialRelationship {
    Intersects,
    Within,
    Contains,
    Touches,
    Overlaps,
    Crosses,
}

impl SpatialRelationship {
    /// Get all relationships
    pub fn all() -> &'static [SpatialRelationship] {
        &[
            SpatialRelationship::Intersects,
            SpatialRelationship::Within,
            SpatialRelationship::Contains,
            SpatialRelationship::Touches,
            SpatialRelationship::Overlaps,
            SpatialRelationship::Crosses,
        ]
    }

    /// Operator name for the `spatialRel` query parameter.
    ///
    /// The service reads these as "query geometry <op> feature", so
    /// `Contains` selects features lying inside the boundary.
    pub fn esri_name(&self) -> &'static str {
        match self {
            SpatialRelationship::Intersects => "esriSpatialRelIntersects",
            SpatialRelationship::Within => "esriSpatialRelWithin",
            SpatialRelationship::Contains => "esriSpatialRelContains",
            SpatialRelationship::Touches => "esriSpatialRelTouches",
            SpatialRelationship::Overlaps => "esriSpatialRelOverlaps",
            SpatialRelationship::Crosses => "esriSpatialRelCrosses",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SpatialRelationship::Intersects => "intersects",
            SpatialRelationship::Within => "within",
            SpatialRelationship::Contains => "contains",
            SpatialRelationship::Touches => "touches",
            SpatialRelationship::Overlaps => "overlaps",
            SpatialRelationship::Crosses => "crosses",
        }
    }
}

impl fmt::Display for SpatialRelationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SpatialRelationship {
    type Err = FetchError;

    /// Accepts the plain names as well as the `esriSpatialRel*` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        if let Some(rel) = SpatialRelationship::all()
            .iter()
            .find(|r| r.name() == lowered)
        {
            return Ok(*rel);
        }
        SpatialRelationship::all()
            .iter()
            .find(|r| r.esri_name().eq_ignore_ascii_case(s.trim()))
            .copied()
            .ok_or_else(|| FetchError::UnsupportedRelationship(s.to_string()))
    }
}
