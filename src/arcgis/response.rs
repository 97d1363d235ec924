//! Decoding of query, count and layer metadata responses.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::esri::EsriGeometry;
use crate::models::{AttributeValue, FeatureGeometry, FeatureId, FeatureRecord};

/// Output encoding requested with the `f` parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    /// Esri JSON (`f=json`)
    #[default]
    Json,
    /// GeoJSON (`f=geojson`)
    GeoJson,
}

impl ResponseFormat {
    pub fn param(&self) -> &'static str {
        match self {
            ResponseFormat::Json => "json",
            ResponseFormat::GeoJson => "geojson",
        }
    }
}

/// Why a single request attempt failed
#[derive(Debug, Clone, PartialEq)]
pub enum RequestError {
    /// Worth retrying at the same offset
    Transient(String),
    /// Service asked us to slow down
    Throttled {
        retry_after: Option<Duration>,
        message: String,
    },
    /// Retrying cannot help
    Permanent(String),
}

impl RequestError {
    /// Classify an HTTP status that is not a success
    pub fn from_status(status: u16, retry_after: Option<Duration>, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, truncate(body, 200));
        match status {
            429 => RequestError::Throttled {
                retry_after,
                message,
            },
            408 | 500..=599 => RequestError::Transient(message),
            _ => RequestError::Permanent(message),
        }
    }

    /// Classify an `{"error": {...}}` body. ArcGIS reports these with HTTP 200.
    pub fn from_service_error(error: &ServiceError) -> Self {
        let message = error.to_string();
        match error.code {
            429 => RequestError::Throttled {
                retry_after: None,
                message,
            },
            408 | 500..=599 => RequestError::Transient(message),
            _ => RequestError::Permanent(message),
        }
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_builder() {
            RequestError::Permanent(format!("invalid request: {}", err))
        } else {
            RequestError::Transient(err.to_string())
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RequestError::Transient(m) | RequestError::Permanent(m) => m,
            RequestError::Throttled { message, .. } => message,
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Error object returned in the response body
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "service error {}: {}", self.code, self.message)?;
        if !self.details.is_empty() {
            write!(f, " ({})", self.details.join("; "))?;
        }
        Ok(())
    }
}

/// Parse a body into JSON, surfacing service error objects
pub fn parse_body(text: &str) -> Result<Value, RequestError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RequestError::Transient(format!("malformed response body: {}", e)))?;

    if let Some(error) = value.get("error") {
        let error: ServiceError = serde_json::from_value(error.clone()).map_err(|e| {
            RequestError::Transient(format!("malformed error object: {}", e))
        })?;
        return Err(RequestError::from_service_error(&error));
    }

    Ok(value)
}

/// Identifier field when neither the caller nor the service names one
pub const DEFAULT_ID_FIELD: &str = "OBJECTID";

/// Layer metadata (`<layer>?f=json`)
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LayerInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub geometry_type: Option<String>,
    #[serde(default)]
    pub max_record_count: Option<u32>,
    #[serde(default)]
    pub object_id_field: Option<String>,
    #[serde(default)]
    pub advanced_query_capabilities: Option<AdvancedQueryCapabilities>,
    #[serde(default)]
    pub fields: Vec<FieldInfo>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedQueryCapabilities {
    #[serde(default)]
    pub supports_pagination: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: String,
}

impl LayerInfo {
    /// Identifier field: explicit `objectIdField`, else the OID-typed field
    pub fn id_field(&self) -> Option<&str> {
        self.object_id_field.as_deref().or_else(|| {
            self.fields
                .iter()
                .find(|f| f.field_type == "esriFieldTypeOID")
                .map(|f| f.name.as_str())
        })
    }

    /// Layers that omit the capability block are assumed to paginate.
    pub fn supports_pagination(&self) -> bool {
        self.advanced_query_capabilities
            .as_ref()
            .map(|c| c.supports_pagination)
            .unwrap_or(true)
    }
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

pub fn parse_count(value: Value) -> Result<u64, RequestError> {
    serde_json::from_value::<CountResponse>(value)
        .map(|c| c.count)
        .map_err(|e| RequestError::Transient(format!("malformed count response: {}", e)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EsriQueryResponse {
    #[serde(default)]
    object_id_field_name: Option<String>,
    #[serde(default)]
    features: Vec<EsriFeature>,
    #[serde(default)]
    exceeded_transfer_limit: bool,
}

#[derive(Debug, Deserialize)]
struct EsriFeature {
    #[serde(default)]
    attributes: serde_json::Map<String, Value>,
    #[serde(default)]
    geometry: Option<EsriGeometry>,
}

/// Records of one page plus the transfer limit flag
#[derive(Debug)]
pub struct DecodedPage {
    pub records: Vec<FeatureRecord>,
    pub exceeded_transfer_limit: bool,
}

/// Decode a query response in the given format.
///
/// `id_field` names the attribute holding the identifier. When it is `None`
/// an Esri JSON response's own `objectIdFieldName` is used, then
/// [`DEFAULT_ID_FIELD`].
pub fn decode_features(
    value: Value,
    format: ResponseFormat,
    id_field: Option<&str>,
) -> Result<DecodedPage, RequestError> {
    match format {
        ResponseFormat::Json => decode_esri(value, id_field),
        ResponseFormat::GeoJson => decode_geojson(value, id_field.unwrap_or(DEFAULT_ID_FIELD)),
    }
}

fn decode_esri(value: Value, id_field: Option<&str>) -> Result<DecodedPage, RequestError> {
    let response: EsriQueryResponse = serde_json::from_value(value)
        .map_err(|e| RequestError::Transient(format!("malformed query response: {}", e)))?;

    let id_field = id_field
        .or(response.object_id_field_name.as_deref())
        .unwrap_or(DEFAULT_ID_FIELD)
        .to_string();

    let records = response
        .features
        .into_iter()
        .map(|feature| {
            let attributes = to_attributes(&feature.attributes);
            let id = lookup_id(&attributes, &id_field)?;
            Ok(FeatureRecord {
                id,
                attributes,
                geometry: feature.geometry.and_then(|g| g.to_feature_geometry()),
            })
        })
        .collect::<Result<Vec<_>, RequestError>>()?;

    Ok(DecodedPage {
        records,
        exceeded_transfer_limit: response.exceeded_transfer_limit,
    })
}

fn decode_geojson(value: Value, id_field: &str) -> Result<DecodedPage, RequestError> {
    // The flag sits at the top level or inside a top-level "properties" object
    let exceeded_transfer_limit = value
        .get("exceededTransferLimit")
        .or_else(|| value.pointer("/properties/exceededTransferLimit"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let collection = match geojson::GeoJson::from_json_value(value) {
        Ok(geojson::GeoJson::FeatureCollection(fc)) => fc,
        Ok(_) => {
            return Err(RequestError::Transient(
                "expected a GeoJSON FeatureCollection".to_string(),
            ))
        }
        Err(e) => {
            return Err(RequestError::Transient(format!(
                "malformed GeoJSON response: {}",
                e
            )))
        }
    };

    let records = collection
        .features
        .into_iter()
        .map(|feature| {
            let attributes = feature
                .properties
                .as_ref()
                .map(to_attributes)
                .unwrap_or_default();

            let id = match &feature.id {
                Some(geojson::feature::Id::Number(n)) => {
                    FeatureId::from_attribute(&AttributeValue::from_json(&Value::Number(n.clone())))
                }
                Some(geojson::feature::Id::String(s)) => Some(FeatureId::Text(s.clone())),
                None => None,
            };
            let id = match id {
                Some(id) => id,
                None => lookup_id(&attributes, id_field)?,
            };

            let geometry = feature
                .geometry
                .and_then(|g| geo::Geometry::<f64>::try_from(g).ok())
                .and_then(FeatureGeometry::from_geo);

            Ok(FeatureRecord {
                id,
                attributes,
                geometry,
            })
        })
        .collect::<Result<Vec<_>, RequestError>>()?;

    Ok(DecodedPage {
        records,
        exceeded_transfer_limit,
    })
}

fn to_attributes(map: &serde_json::Map<String, Value>) -> BTreeMap<String, AttributeValue> {
    map.iter()
        .map(|(k, v)| (k.clone(), AttributeValue::from_json(v)))
        .collect()
}

fn lookup_id(
    attributes: &BTreeMap<String, AttributeValue>,
    id_field: &str,
) -> Result<FeatureId, RequestError> {
    attributes
        .get(id_field)
        .or_else(|| {
            // Field names are case-insensitive on most services
            attributes
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(id_field))
                .map(|(_, v)| v)
        })
        .and_then(FeatureId::from_attribute)
        .ok_or_else(|| {
            RequestError::Permanent(format!(
                "feature is missing identifier field '{}'",
                id_field
            ))
        })
}
