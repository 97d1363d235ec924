//! Esri JSON geometry representation.
//!
//! Polygons are a flat list of rings: clockwise rings are exteriors and
//! counter-clockwise rings are holes of the exterior that contains them.

use geo::{Contains, Coord, LineString, MultiLineString, MultiPolygon, Point, Polygon, Winding};
use serde::{Deserialize, Serialize};

use crate::models::FeatureGeometry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpatialReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wkid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_wkid: Option<u32>,
}

impl SpatialReference {
    pub fn from_wkid(wkid: u32) -> Self {
        Self {
            wkid: Some(wkid),
            latest_wkid: None,
        }
    }

    /// Prefer `latestWkid` (EPSG code) over the legacy Esri id
    pub fn code(&self) -> Option<u32> {
        self.latest_wkid.or(self.wkid)
    }
}

/// Geometry object as found in query requests and `f=json` responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EsriGeometry {
    Polygon {
        rings: Vec<Vec<Vec<f64>>>,
        #[serde(
            rename = "spatialReference",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        spatial_reference: Option<SpatialReference>,
    },
    Polyline {
        paths: Vec<Vec<Vec<f64>>>,
        #[serde(
            rename = "spatialReference",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        spatial_reference: Option<SpatialReference>,
    },
    Point {
        x: Option<f64>,
        y: Option<f64>,
        #[serde(
            rename = "spatialReference",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        spatial_reference: Option<SpatialReference>,
    },
}

impl EsriGeometry {
    /// Encode a multipolygon as Esri rings, exteriors clockwise and holes
    /// counter-clockwise. Coordinates are copied verbatim.
    pub fn from_multipolygon(geometry: &MultiPolygon<f64>, wkid: Option<u32>) -> Self {
        let mut rings = Vec::new();
        for polygon in geometry.iter() {
            rings.push(ring_coords(polygon.exterior(), true));
            for interior in polygon.interiors() {
                rings.push(ring_coords(interior, false));
            }
        }
        EsriGeometry::Polygon {
            rings,
            spatial_reference: wkid.map(SpatialReference::from_wkid),
        }
    }

    pub fn spatial_reference(&self) -> Option<&SpatialReference> {
        match self {
            EsriGeometry::Polygon {
                spatial_reference, ..
            }
            | EsriGeometry::Polyline {
                spatial_reference, ..
            }
            | EsriGeometry::Point {
                spatial_reference, ..
            } => spatial_reference.as_ref(),
        }
    }

    /// Convert into a feature geometry. Empty geometries yield `None`.
    pub fn to_feature_geometry(&self) -> Option<FeatureGeometry> {
        match self {
            EsriGeometry::Point { x, y, .. } => match (x, y) {
                (Some(x), Some(y)) if x.is_finite() && y.is_finite() => {
                    Some(FeatureGeometry::Point(Point::new(*x, *y)))
                }
                _ => None,
            },
            EsriGeometry::Polyline { paths, .. } => {
                let lines: Vec<LineString<f64>> = paths
                    .iter()
                    .map(|p| to_line_string(p))
                    .filter(|ls| ls.0.len() >= 2)
                    .collect();
                if lines.is_empty() {
                    None
                } else {
                    Some(FeatureGeometry::Line(MultiLineString::new(lines)))
                }
            }
            EsriGeometry::Polygon { rings, .. } => {
                let rings = rings.iter().map(|r| to_line_string(r)).collect();
                let mut polygons = rings_to_multipolygon(rings);
                match polygons.0.len() {
                    0 => None,
                    1 => polygons.0.pop().map(FeatureGeometry::Polygon),
                    _ => Some(FeatureGeometry::MultiPolygon(polygons)),
                }
            }
        }
    }
}

fn ring_coords(ring: &LineString<f64>, clockwise: bool) -> Vec<Vec<f64>> {
    let mut ring = ring.clone();
    ring.close();
    if clockwise {
        ring.make_cw_winding();
    } else {
        ring.make_ccw_winding();
    }
    ring.0.iter().map(|c| vec![c.x, c.y]).collect()
}

fn to_line_string(points: &[Vec<f64>]) -> LineString<f64> {
    points
        .iter()
        .filter(|p| p.len() >= 2)
        .map(|p| Coord { x: p[0], y: p[1] })
        .collect::<Vec<_>>()
        .into()
}

/// Group Esri rings into polygons by winding order.
///
/// Holes are attached to the first exterior containing their first vertex,
/// falling back to the most recent exterior. If a service returns only
/// counter-clockwise rings they are all treated as exteriors.
pub fn rings_to_multipolygon(rings: Vec<LineString<f64>>) -> MultiPolygon<f64> {
    let mut exteriors: Vec<Polygon<f64>> = Vec::new();
    let mut holes: Vec<LineString<f64>> = Vec::new();

    for mut ring in rings {
        ring.close();
        if ring.0.len() < 4 {
            continue;
        }
        if ring.is_cw() {
            exteriors.push(Polygon::new(ring, vec![]));
        } else {
            holes.push(ring);
        }
    }

    if exteriors.is_empty() {
        return MultiPolygon::new(
            holes
                .into_iter()
                .map(|ring| Polygon::new(ring, vec![]))
                .collect(),
        );
    }

    for hole in holes {
        let first = hole.0[0];
        let target = exteriors
            .iter()
            .position(|p| p.contains(&first))
            .unwrap_or(exteriors.len() - 1);
        exteriors[target].interiors_push(hole);
    }

    MultiPolygon::new(exteriors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Area};

    #[test]
    fn test_encode_orients_rings() {
        // counter-clockwise exterior, clockwise hole (GeoJSON convention)
        let poly = polygon!(
            exterior: [
                (x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 10.0, y: 10.0), (x: 0.0, y: 10.0)
            ],
            interiors: [[
                (x: 2.0, y: 2.0), (x: 2.0, y: 4.0), (x: 4.0, y: 4.0), (x: 4.0, y: 2.0)
            ]],
        );
        let encoded = EsriGeometry::from_multipolygon(&MultiPolygon::new(vec![poly]), Some(4326));

        let EsriGeometry::Polygon { rings, spatial_reference } = &encoded else {
            panic!("expected polygon");
        };
        assert_eq!(spatial_reference.unwrap().wkid, Some(4326));
        assert_eq!(rings.len(), 2);
        assert!(to_line_string(&rings[0]).is_cw());
        assert!(to_line_string(&rings[1]).is_ccw());
    }

    #[test]
    fn test_rings_round_trip_through_json() {
        let json = r#"{"rings":[[[0,0],[0,10],[10,10],[10,0],[0,0]],[[2,2],[4,2],[4,4],[2,4],[2,2]]],"spatialReference":{"wkid":102100,"latestWkid":3857}}"#;
        let geometry: EsriGeometry = serde_json::from_str(json).unwrap();
        assert_eq!(geometry.spatial_reference().unwrap().code(), Some(3857));

        match geometry.to_feature_geometry() {
            Some(FeatureGeometry::Polygon(p)) => {
                assert_eq!(p.interiors().len(), 1);
                assert_eq!(p.unsigned_area(), 96.0);
            }
            other => panic!("unexpected geometry {:?}", other),
        }
    }

    #[test]
    fn test_two_exteriors_make_multipolygon() {
        let json = r#"{"rings":[[[0,0],[0,1],[1,1],[1,0],[0,0]],[[5,5],[5,6],[6,6],[6,5],[5,5]]]}"#;
        let geometry: EsriGeometry = serde_json::from_str(json).unwrap();
        assert!(matches!(
            geometry.to_feature_geometry(),
            Some(FeatureGeometry::MultiPolygon(mp)) if mp.0.len() == 2
        ));
    }

    #[test]
    fn test_point_and_empty_point() {
        let point: EsriGeometry = serde_json::from_str(r#"{"x":151.2,"y":-33.8}"#).unwrap();
        assert_eq!(
            point.to_feature_geometry(),
            Some(FeatureGeometry::Point(Point::new(151.2, -33.8)))
        );

        let empty: EsriGeometry = serde_json::from_str(r#"{"x":null,"y":null}"#).unwrap();
        assert_eq!(empty.to_feature_geometry(), None);
    }
}
