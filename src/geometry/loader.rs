//! Boundary loading from GeoJSON, Shapefile and GeoPackage files.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use geo::{Area, BooleanOps, Coord, Geometry, LineString, MultiPolygon, Polygon, Validation};
use geojson::GeoJson;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::arcgis::esri::rings_to_multipolygon;
use crate::error::{FetchError, FetchResult};
use crate::geometry::{gpkg, prj};
use crate::models::{BoundaryGeometry, Crs, WGS84};

/// Supported boundary file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryFormat {
    GeoJson,
    Shapefile,
    GeoPackage,
}

impl BoundaryFormat {
    /// Sniff the format from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "geojson" | "json" => Some(BoundaryFormat::GeoJson),
            "shp" => Some(BoundaryFormat::Shapefile),
            "gpkg" => Some(BoundaryFormat::GeoPackage),
            _ => None,
        }
    }

    /// Use the declared format when given, otherwise sniff from the path.
    pub fn resolve(path: &Path, declared: Option<&str>) -> FetchResult<Self> {
        let unsupported = |format: String| FetchError::UnsupportedFormat {
            path: path.to_path_buf(),
            format,
        };

        match declared {
            Some(name) => name.parse().map_err(|_| unsupported(name.to_string())),
            None => Self::from_path(path).ok_or_else(|| {
                unsupported(
                    path.extension()
                        .and_then(|e| e.to_str())
                        .unwrap_or("<none>")
                        .to_string(),
                )
            }),
        }
    }
}

impl FromStr for BoundaryFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "geojson" | "json" => Ok(BoundaryFormat::GeoJson),
            "shapefile" | "shp" => Ok(BoundaryFormat::Shapefile),
            "geopackage" | "gpkg" => Ok(BoundaryFormat::GeoPackage),
            other => Err(format!("unknown boundary format '{}'", other)),
        }
    }
}

impl fmt::Display for BoundaryFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundaryFormat::GeoJson => write!(f, "geojson"),
            BoundaryFormat::Shapefile => write!(f, "shapefile"),
            BoundaryFormat::GeoPackage => write!(f, "geopackage"),
        }
    }
}

/// Polygons read from a file before dissolving
struct RawBoundary {
    polygons: Vec<Polygon<f64>>,
    crs: Option<Crs>,
    skipped: usize,
}

/// Load a boundary file and dissolve its polygonal features into one
/// geometry.
///
/// `source_crs` overrides whatever CRS the file declares.
pub fn load_boundary(
    path: &Path,
    format: BoundaryFormat,
    source_crs: Option<Crs>,
) -> FetchResult<BoundaryGeometry> {
    let read_err = |cause: String| FetchError::Read {
        path: path.to_path_buf(),
        cause,
    };

    let raw = match format {
        BoundaryFormat::GeoJson => read_geojson(path).map_err(read_err)?,
        BoundaryFormat::Shapefile => read_shapefile(path).map_err(read_err)?,
        BoundaryFormat::GeoPackage => {
            let (polygons, crs, skipped) = gpkg::read_polygons(path).map_err(read_err)?;
            RawBoundary {
                polygons,
                crs,
                skipped,
            }
        }
    };

    if raw.skipped > 0 {
        warn!(
            "Skipped {} non-polygonal features in {}",
            raw.skipped,
            path.display()
        );
    }
    if raw.polygons.is_empty() {
        return Err(FetchError::InvalidGeometry(format!(
            "{} contains no polygonal features",
            path.display()
        )));
    }

    let count = raw.polygons.len();
    let geometry = dissolve(raw.polygons)?;

    let crs = match (source_crs, raw.crs) {
        (Some(declared), Some(found)) if declared != found => {
            warn!(
                "Declared source CRS {} overrides {} found in {}",
                declared,
                found,
                path.display()
            );
            Some(declared)
        }
        (declared, found) => declared.or(found),
    };

    info!(
        "Loaded boundary from {} ({}): {} polygons dissolved into {}, CRS {}",
        path.display(),
        format,
        count,
        geometry.0.len(),
        crs.map(|c| c.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );

    Ok(BoundaryGeometry::new(geometry, crs))
}

/// Union polygons into one valid multipolygon
fn dissolve(polygons: Vec<Polygon<f64>>) -> FetchResult<MultiPolygon<f64>> {
    let mut merged = if polygons.len() == 1 {
        MultiPolygon::new(polygons)
    } else {
        polygons
            .iter()
            .fold(MultiPolygon::new(vec![]), |acc, polygon| acc.union(polygon))
    };

    if !merged.is_valid() {
        debug!("Boundary invalid after dissolve, normalizing");
        merged = MultiPolygon::new(vec![]).union(&merged);
    }

    if merged.0.is_empty() || merged.unsigned_area() == 0.0 {
        return Err(FetchError::InvalidGeometry(
            "boundary has zero area".to_string(),
        ));
    }
    if !merged.is_valid() {
        return Err(FetchError::InvalidGeometry(
            "boundary is not a valid polygon after dissolve".to_string(),
        ));
    }

    Ok(merged)
}

fn read_geojson(path: &Path) -> Result<RawBoundary, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let geojson: GeoJson = text.parse().map_err(|e: geojson::Error| e.to_string())?;

    let (geometries, members) = match geojson {
        GeoJson::FeatureCollection(fc) => (
            fc.features.into_iter().map(|f| f.geometry).collect(),
            fc.foreign_members,
        ),
        GeoJson::Feature(f) => (vec![f.geometry], f.foreign_members),
        GeoJson::Geometry(g) => {
            let members = g.foreign_members.clone();
            (vec![Some(g)], members)
        }
    };

    let crs = match members.as_ref().and_then(legacy_crs_name) {
        Some(name) => match name.parse::<Crs>() {
            Ok(crs) => Some(crs),
            Err(e) => {
                warn!("Ignoring GeoJSON crs member: {}", e);
                None
            }
        },
        None => Some(WGS84),
    };

    let mut polygons = Vec::new();
    let mut skipped = 0;
    for geometry in geometries {
        let Some(geometry) = geometry else {
            skipped += 1;
            continue;
        };
        match Geometry::<f64>::try_from(geometry) {
            Ok(g) => skipped += collect_polygons(g, &mut polygons),
            Err(e) => {
                warn!("Skipping unconvertible GeoJSON geometry: {}", e);
                skipped += 1;
            }
        }
    }

    Ok(RawBoundary {
        polygons,
        crs,
        skipped,
    })
}

/// `crs.properties.name` from a pre-RFC 7946 document
fn legacy_crs_name(members: &Map<String, Value>) -> Option<&str> {
    members.get("crs")?.get("properties")?.get("name")?.as_str()
}

/// Push polygonal parts into `out`, returning the number of skipped parts
fn collect_polygons(geometry: Geometry<f64>, out: &mut Vec<Polygon<f64>>) -> usize {
    match geometry {
        Geometry::Polygon(p) => {
            out.push(p);
            0
        }
        Geometry::MultiPolygon(mp) => {
            out.extend(mp.0);
            0
        }
        Geometry::Rect(r) => {
            out.push(r.to_polygon());
            0
        }
        Geometry::GeometryCollection(gc) => gc
            .0
            .into_iter()
            .map(|g| collect_polygons(g, out))
            .sum(),
        _ => 1,
    }
}

macro_rules! polygon_rings {
    ($polygon:expr) => {
        $polygon
            .rings()
            .iter()
            .map(|ring| {
                ring.points()
                    .iter()
                    .map(|p| Coord { x: p.x, y: p.y })
                    .collect::<LineString<f64>>()
            })
            .collect::<Vec<_>>()
    };
}

fn read_shapefile(path: &Path) -> Result<RawBoundary, String> {
    let shapes = shapefile::read_shapes(path).map_err(|e| e.to_string())?;

    let mut polygons = Vec::new();
    let mut skipped = 0;
    for shape in shapes {
        // Shapefile rings share the Esri orientation convention
        let rings = match shape {
            shapefile::Shape::Polygon(p) => polygon_rings!(p),
            shapefile::Shape::PolygonM(p) => polygon_rings!(p),
            shapefile::Shape::PolygonZ(p) => polygon_rings!(p),
            _ => {
                skipped += 1;
                continue;
            }
        };
        polygons.extend(rings_to_multipolygon(rings).0);
    }

    let crs = prj_path(path)
        .and_then(|prj| std::fs::read_to_string(prj).ok())
        .and_then(|wkt| {
            let crs = prj::crs_from_wkt(&wkt);
            if crs.is_none() {
                warn!("Unrecognized projection in .prj for {}", path.display());
            }
            crs
        });

    Ok(RawBoundary {
        polygons,
        crs,
        skipped,
    })
}

fn prj_path(shp: &Path) -> Option<PathBuf> {
    ["prj", "PRJ"]
        .iter()
        .map(|ext| shp.with_extension(ext))
        .find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use geo::polygon;

    fn write_temp(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_format_resolution() {
        assert_eq!(
            BoundaryFormat::resolve(Path::new("a/lga.GeoJSON"), None).unwrap(),
            BoundaryFormat::GeoJson
        );
        assert_eq!(
            BoundaryFormat::resolve(Path::new("lga.dat"), Some("shapefile")).unwrap(),
            BoundaryFormat::Shapefile
        );
        assert!(matches!(
            BoundaryFormat::resolve(Path::new("lga.kml"), None),
            Err(FetchError::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            BoundaryFormat::resolve(Path::new("lga.geojson"), Some("kml")),
            Err(FetchError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_load_geojson_defaults_to_wgs84() {
        let file = write_temp(
            ".geojson",
            r#"{"type":"FeatureCollection","features":[
                {"type":"Feature","properties":{},"geometry":{"type":"Polygon","coordinates":[[[0,0],[10,0],[10,10],[0,10],[0,0]]]}}
            ]}"#,
        );
        let boundary = load_boundary(file.path(), BoundaryFormat::GeoJson, None).unwrap();
        assert_eq!(boundary.crs, Some(WGS84));
        assert_eq!(boundary.geometry.unsigned_area(), 100.0);
    }

    #[test]
    fn test_load_geojson_dissolves_and_skips_points() {
        let file = write_temp(
            ".geojson",
            r#"{"type":"FeatureCollection",
                "crs":{"type":"name","properties":{"name":"urn:ogc:def:crs:EPSG::28356"}},
                "features":[
                {"type":"Feature","properties":{},"geometry":{"type":"Polygon","coordinates":[[[0,0],[2,0],[2,2],[0,2],[0,0]]]}},
                {"type":"Feature","properties":{},"geometry":{"type":"Polygon","coordinates":[[[1,0],[3,0],[3,2],[1,2],[1,0]]]}},
                {"type":"Feature","properties":{},"geometry":{"type":"Point","coordinates":[5,5]}}
            ]}"#,
        );
        let boundary = load_boundary(file.path(), BoundaryFormat::GeoJson, None).unwrap();
        assert_eq!(boundary.crs, Some(Crs(28356)));
        assert_eq!(boundary.polygon_count(), 1);
        assert!((boundary.geometry.unsigned_area() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_declared_crs_overrides_file() {
        let file = write_temp(
            ".json",
            r#"{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,1],[0,0]]]}"#,
        );
        let boundary =
            load_boundary(file.path(), BoundaryFormat::GeoJson, Some(Crs(7856))).unwrap();
        assert_eq!(boundary.crs, Some(Crs(7856)));
    }

    #[test]
    fn test_no_polygons_is_invalid() {
        let file = write_temp(
            ".geojson",
            r#"{"type":"Feature","properties":{},"geometry":{"type":"LineString","coordinates":[[0,0],[1,1]]}}"#,
        );
        assert!(matches!(
            load_boundary(file.path(), BoundaryFormat::GeoJson, None),
            Err(FetchError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_unreadable_file() {
        let file = write_temp(".geojson", "not geojson");
        assert!(matches!(
            load_boundary(file.path(), BoundaryFormat::GeoJson, None),
            Err(FetchError::Read { .. })
        ));
    }

    #[test]
    fn test_disjoint_polygons_stay_separate() {
        let polygons = vec![
            geo::polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)],
            geo::polygon![(x: 5.0, y: 5.0), (x: 6.0, y: 5.0), (x: 6.0, y: 6.0), (x: 5.0, y: 6.0)],
        ];
        let merged = dissolve(polygons).unwrap();
        assert_eq!(merged.0.len(), 2);
        assert!((merged.unsigned_area() - 2.0).abs() < 1e-9);
    }
}
