//! HTTP client for a single ArcGIS feature service layer.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use tracing::debug;
use url::Url;

use super::response::{
    decode_features, parse_body, parse_count, LayerInfo, RequestError, ResponseFormat,
};
use super::Page;
use crate::error::{FetchError, FetchResult};
use crate::geometry::QueryGeometry;
use crate::models::Crs;

/// Query strings longer than this are sent as a form POST
const MAX_GET_QUERY_LEN: usize = 1800;

/// Everything about a query that stays fixed across pages
#[derive(Debug, Clone)]
pub struct QuerySpec {
    /// `None` runs an attribute-only query
    pub geometry: Option<QueryGeometry>,
    pub where_clause: String,
    pub out_fields: String,
    pub out_crs: Crs,
    pub format: ResponseFormat,
    /// Overrides the response's `objectIdFieldName`
    pub id_field: Option<String>,
}

/// Client bound to one layer endpoint (`.../FeatureServer/<n>`)
#[derive(Clone)]
pub struct LayerClient {
    http: Client,
    layer_url: Url,
}

impl LayerClient {
    /// Accepts the layer URL with or without a trailing `/query`.
    pub fn new(http: Client, service_url: &str) -> FetchResult<Self> {
        let trimmed = service_url.trim().trim_end_matches('/');
        let trimmed = trimmed.strip_suffix("/query").unwrap_or(trimmed);

        let layer_url = Url::parse(trimmed)
            .map_err(|e| FetchError::Config(format!("invalid service URL '{}': {}", service_url, e)))?;

        if !matches!(layer_url.scheme(), "http" | "https") {
            return Err(FetchError::Config(format!(
                "service URL must be http(s): {}",
                service_url
            )));
        }

        Ok(Self { http, layer_url })
    }

    pub fn layer_url(&self) -> &Url {
        &self.layer_url
    }

    pub fn query_url(&self) -> Url {
        let mut url = self.layer_url.clone();
        url.set_path(&format!("{}/query", url.path().trim_end_matches('/')));
        url
    }

    /// Fetch layer metadata (record limit, id field, pagination support)
    pub async fn layer_info(&self) -> Result<LayerInfo, RequestError> {
        let value = self
            .send(self.layer_url.clone(), vec![("f", "json".to_string())])
            .await?;
        serde_json::from_value(value)
            .map_err(|e| RequestError::Transient(format!("malformed layer metadata: {}", e)))
    }

    /// Number of features matching the query
    pub async fn count(&self, spec: &QuerySpec) -> Result<u64, RequestError> {
        let mut params = base_params(spec);
        params.retain(|(k, _)| *k != "f" && *k != "outFields" && *k != "returnGeometry");
        params.push(("returnCountOnly", "true".to_string()));
        params.push(("f", "json".to_string()));

        let value = self.send(self.query_url(), params).await?;
        parse_count(value)
    }

    /// Fetch one page. `window` is `(offset, record_count)`; `None` sends
    /// an unpaged request.
    pub async fn query_page(
        &self,
        spec: &QuerySpec,
        window: Option<(u64, u32)>,
    ) -> Result<Page, RequestError> {
        let mut params = base_params(spec);
        if let Some((offset, count)) = window {
            params.push(("resultOffset", offset.to_string()));
            params.push(("resultRecordCount", count.to_string()));
        }

        let value = self.send(self.query_url(), params).await?;
        let decoded = decode_features(value, spec.format, spec.id_field.as_deref())?;

        Ok(Page {
            offset: window.map(|(offset, _)| offset).unwrap_or(0),
            records: decoded.records,
            exceeded_transfer_limit: decoded.exceeded_transfer_limit,
        })
    }

    async fn send(
        &self,
        url: Url,
        params: Vec<(&'static str, String)>,
    ) -> Result<serde_json::Value, RequestError> {
        let encoded: String = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())))
            .finish();

        let request = if encoded.len() > MAX_GET_QUERY_LEN {
            debug!("POST {} ({} byte body)", url, encoded.len());
            self.http
                .post(url)
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(encoded)
        } else {
            let mut url = url;
            url.set_query(Some(&encoded));
            debug!("GET {}", url);
            self.http.get(url)
        };

        let response = request
            .send()
            .await
            .map_err(|e| RequestError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(RequestError::from_status(status.as_u16(), retry_after, &body));
        }

        let text = response
            .text()
            .await
            .map_err(|e| RequestError::from_reqwest(&e))?;

        parse_body(&text)
    }
}

fn base_params(spec: &QuerySpec) -> Vec<(&'static str, String)> {
    let mut params = vec![("where", spec.where_clause.clone())];
    if let Some(geometry) = &spec.geometry {
        params.extend([
            ("geometry", geometry.json().to_string()),
            ("geometryType", geometry.geometry_type().to_string()),
            ("spatialRel", geometry.relationship().esri_name().to_string()),
            ("inSR", geometry.wkid().to_string()),
        ]);
    }
    params.extend([
        ("outFields", spec.out_fields.clone()),
        ("returnGeometry", "true".to_string()),
        ("outSR", spec.out_crs.wkid().to_string()),
        ("f", spec.format.param().to_string()),
    ]);
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_url_normalization() {
        let client = LayerClient::new(
            Client::new(),
            "https://example.com/server/rest/services/Lots/FeatureServer/8/query",
        )
        .unwrap();
        assert_eq!(
            client.layer_url().as_str(),
            "https://example.com/server/rest/services/Lots/FeatureServer/8"
        );
        assert_eq!(
            client.query_url().as_str(),
            "https://example.com/server/rest/services/Lots/FeatureServer/8/query"
        );

        let client = LayerClient::new(
            Client::new(),
            "https://example.com/arcgis/rest/services/X/MapServer/2/",
        )
        .unwrap();
        assert_eq!(
            client.query_url().as_str(),
            "https://example.com/arcgis/rest/services/X/MapServer/2/query"
        );
    }

    fn spec(geometry: Option<QueryGeometry>) -> QuerySpec {
        QuerySpec {
            geometry,
            where_clause: "ZONE = 'R2'".to_string(),
            out_fields: "*".to_string(),
            out_crs: crate::models::WGS84,
            format: ResponseFormat::Json,
            id_field: None,
        }
    }

    #[test]
    fn test_spatial_params_follow_geometry() {
        use crate::geometry::encode;
        use crate::models::{BoundaryGeometry, SpatialRelationship, WGS84};
        use geo::{polygon, MultiPolygon};

        let boundary = BoundaryGeometry::new(
            MultiPolygon::new(vec![polygon![
                (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)
            ]]),
            Some(WGS84),
        );
        let geometry = encode(&boundary, SpatialRelationship::Touches).unwrap();

        let params = base_params(&spec(Some(geometry)));
        let keys: Vec<&str> = params.iter().map(|(k, _)| *k).collect();
        assert!(keys.contains(&"geometry"));
        assert!(params.contains(&("spatialRel", "esriSpatialRelTouches".to_string())));
        assert!(params.contains(&("inSR", "4326".to_string())));

        let params = base_params(&spec(None));
        for key in ["geometry", "geometryType", "spatialRel", "inSR"] {
            assert!(params.iter().all(|(k, _)| *k != key), "{} sent", key);
        }
        assert_eq!(params[0], ("where", "ZONE = 'R2'".to_string()));
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(matches!(
            LayerClient::new(Client::new(), "not a url"),
            Err(FetchError::Config(_))
        ));
        assert!(matches!(
            LayerClient::new(Client::new(), "ftp://example.com/layer/0"),
            Err(FetchError::Config(_))
        ));
    }
}
