//! Boundary polygon and coordinate reference system types.

use std::fmt;
use std::str::FromStr;

use geo::MultiPolygon;
use serde::{Deserialize, Serialize};

/// WGS 84 geographic coordinates, the default for GeoJSON and ArcGIS queries.
pub const WGS84: Crs = Crs(4326);

/// Coordinate reference system, identified by its EPSG code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Crs(pub u32);

impl Crs {
    pub fn epsg(&self) -> u32 {
        self.0
    }

    /// Well-known id as sent in `inSR` / `outSR` / `spatialReference.wkid`.
    pub fn wkid(&self) -> u32 {
        self.0
    }

    /// Map Esri well-known ids onto their EPSG equivalents.
    pub fn from_wkid(wkid: u32) -> Self {
        match wkid {
            102100 | 102113 | 900913 => Crs(3857),
            other => Crs(other),
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

impl FromStr for Crs {
    type Err = String;

    /// Accepts `EPSG:28356`, `28356`, `urn:ogc:def:crs:EPSG::28356`,
    /// `urn:ogc:def:crs:OGC:1.3:CRS84` and `CRS84`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let upper = s.to_ascii_uppercase();

        if upper.ends_with("CRS84") {
            return Ok(WGS84);
        }

        let code = if let Some(rest) = upper.strip_prefix("EPSG:") {
            rest
        } else if upper.starts_with("URN:OGC:DEF:CRS:EPSG:") {
            upper.rsplit(':').next().unwrap_or("")
        } else {
            upper.as_str()
        };

        code.trim()
            .parse::<u32>()
            .map(Crs::from_wkid)
            .map_err(|_| format!("unrecognized CRS identifier '{}'", s))
    }
}

/// A polygonal boundary used as a query filter.
///
/// `crs` is `None` when the source file did not declare one; such a boundary
/// cannot be reprojected.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryGeometry {
    pub geometry: MultiPolygon<f64>,
    pub crs: Option<Crs>,
}

impl BoundaryGeometry {
    pub fn new(geometry: MultiPolygon<f64>, crs: Option<Crs>) -> Self {
        Self { geometry, crs }
    }

    /// Number of polygons in the boundary
    pub fn polygon_count(&self) -> usize {
        self.geometry.0.len()
    }
}
