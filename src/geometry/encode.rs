//! Encode a boundary as the `geometry` parameter of a query.

use geo::{Area, Validation};
use tracing::debug;

use crate::arcgis::EsriGeometry;
use crate::error::{FetchError, FetchResult};
use crate::models::{BoundaryGeometry, Crs, SpatialRelationship};

/// Wire form of a boundary plus the relationship it is queried with.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryGeometry {
    json: String,
    crs: Crs,
    relationship: SpatialRelationship,
}

impl QueryGeometry {
    /// Esri JSON polygon text
    pub fn json(&self) -> &str {
        &self.json
    }

    pub fn geometry_type(&self) -> &'static str {
        "esriGeometryPolygon"
    }

    pub fn relationship(&self) -> SpatialRelationship {
        self.relationship
    }

    /// Value for the `inSR` parameter
    pub fn wkid(&self) -> u32 {
        self.crs.wkid()
    }
}

/// Encode an already reprojected boundary.
///
/// Rings are written exterior-clockwise and coordinates are emitted with
/// shortest round-trip formatting, so no precision is lost.
pub fn encode(
    boundary: &BoundaryGeometry,
    relationship: SpatialRelationship,
) -> FetchResult<QueryGeometry> {
    let crs = boundary.crs.ok_or_else(|| {
        FetchError::Encode("boundary has no coordinate reference system".to_string())
    })?;

    if boundary.geometry.0.is_empty() || boundary.geometry.unsigned_area() == 0.0 {
        return Err(FetchError::Encode("boundary is empty".to_string()));
    }
    if !boundary.geometry.is_valid() {
        return Err(FetchError::Encode(
            "boundary is not a valid polygon".to_string(),
        ));
    }

    let esri = EsriGeometry::from_multipolygon(&boundary.geometry, Some(crs.wkid()));
    let json = serde_json::to_string(&esri)
        .map_err(|e| FetchError::Encode(e.to_string()))?;

    debug!(
        "Encoded boundary: {} polygons, {} bytes, {}",
        boundary.polygon_count(),
        json.len(),
        relationship.esri_name()
    );

    Ok(QueryGeometry {
        json,
        crs,
        relationship,
    })
}
