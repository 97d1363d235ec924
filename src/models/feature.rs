//! Feature records retrieved from a service layer.

use std::collections::BTreeMap;
use std::fmt;

use geo::{Geometry, LineString, MultiLineString, MultiPolygon, Point, Polygon};
use serde::{Deserialize, Serialize};

/// Stable per-layer identifier (usually the OBJECTID field)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureId {
    Int(i64),
    Text(String),
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureId::Int(i) => write!(f, "{}", i),
            FeatureId::Text(s) => f.write_str(s),
        }
    }
}

impl FeatureId {
    /// Extract an identifier from an attribute value.
    ///
    /// Integral floats (e.g. `12.0`) are accepted since some services emit
    /// OBJECTIDs as doubles.
    pub fn from_attribute(value: &AttributeValue) -> Option<Self> {
        match value {
            AttributeValue::Int(i) => Some(FeatureId::Int(*i)),
            AttributeValue::Float(f) if f.fract() == 0.0 && f.is_finite() => {
                Some(FeatureId::Int(*f as i64))
            }
            AttributeValue::Text(s) if !s.is_empty() => Some(FeatureId::Text(s.clone())),
            _ => None,
        }
    }
}

/// Attribute value kinds returned by feature services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttributeValue {
    /// Convert a JSON scalar. Nested arrays/objects are kept as their JSON text.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => AttributeValue::Null,
            serde_json::Value::Bool(b) => AttributeValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    AttributeValue::Int(i)
                } else {
                    AttributeValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => AttributeValue::Text(s.clone()),
            other => AttributeValue::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttributeValue::Null => serde_json::Value::Null,
            AttributeValue::Bool(b) => serde_json::Value::Bool(*b),
            AttributeValue::Int(i) => serde_json::Value::from(*i),
            AttributeValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            AttributeValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// Geometry kinds that appear in retrieved features
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureGeometry {
    Point(Point<f64>),
    Line(MultiLineString<f64>),
    Polygon(Polygon<f64>),
    MultiPolygon(MultiPolygon<f64>),
}

impl FeatureGeometry {
    pub fn to_geo(&self) -> Geometry<f64> {
        match self {
            FeatureGeometry::Point(p) => Geometry::Point(*p),
            FeatureGeometry::Line(ml) => {
                if ml.0.len() == 1 {
                    Geometry::LineString(ml.0[0].clone())
                } else {
                    Geometry::MultiLineString(ml.clone())
                }
            }
            FeatureGeometry::Polygon(p) => Geometry::Polygon(p.clone()),
            FeatureGeometry::MultiPolygon(mp) => Geometry::MultiPolygon(mp.clone()),
        }
    }

    /// Narrow a `geo` geometry to the supported kinds
    pub fn from_geo(geometry: Geometry<f64>) -> Option<Self> {
        match geometry {
            Geometry::Point(p) => Some(FeatureGeometry::Point(p)),
            Geometry::LineString(ls) => Some(FeatureGeometry::Line(MultiLineString::new(vec![ls]))),
            Geometry::Line(l) => Some(FeatureGeometry::Line(MultiLineString::new(vec![
                LineString::from(vec![l.start, l.end]),
            ]))),
            Geometry::MultiLineString(ml) => Some(FeatureGeometry::Line(ml)),
            Geometry::Polygon(p) => Some(FeatureGeometry::Polygon(p)),
            Geometry::MultiPolygon(mp) => {
                if mp.0.len() == 1 {
                    mp.0.into_iter().next().map(FeatureGeometry::Polygon)
                } else {
                    Some(FeatureGeometry::MultiPolygon(mp))
                }
            }
            Geometry::Rect(r) => Some(FeatureGeometry::Polygon(r.to_polygon())),
            Geometry::Triangle(t) => Some(FeatureGeometry::Polygon(t.to_polygon())),
            _ => None,
        }
    }
}

/// One retrieved entity
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    pub id: FeatureId,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub geometry: Option<FeatureGeometry>,
}

impl FeatureRecord {
    /// Convert into a GeoJSON feature with the identifier as the feature id
    pub fn to_geojson(&self) -> geojson::Feature {
        let properties: serde_json::Map<String, serde_json::Value> = self
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();

        let id = match &self.id {
            FeatureId::Int(i) => geojson::feature::Id::Number((*i).into()),
            FeatureId::Text(s) => geojson::feature::Id::String(s.clone()),
        };

        geojson::Feature {
            bbox: None,
            geometry: self
                .geometry
                .as_ref()
                .map(|g| geojson::Geometry::new(geojson::Value::from(&g.to_geo()))),
            id: Some(id),
            properties: Some(properties),
            foreign_members: None,
        }
    }
}
