use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::backfill::GeometrySource;
use crate::error::FetchError;
use crate::feature::RawFeature;
use crate::paginator::{Page, PageRequest, PageSource};
use crate::retry::Attempt;
use crate::session::Session;
use crate::util::{layer_base, urljoin};

/// Layer metadata from `<layer>?f=json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LayerInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "objectIdField", alias = "objectIdFieldName")]
    pub object_id_field: Option<String>,
    #[serde(default, rename = "maxRecordCount")]
    pub max_record_count: Option<usize>,
    #[serde(default, rename = "standardMaxRecordCount")]
    pub standard_max_record_count: Option<usize>,
    #[serde(default)]
    pub fields: Vec<FieldInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldInfo {
    pub name: String,
}

impl LayerInfo {
    /// Object id field: declared, else the first field, else `OBJECTID`.
    pub fn id_field(&self) -> String {
        self.object_id_field
            .clone()
            .or_else(|| self.fields.first().map(|f| f.name.clone()))
            .unwrap_or_else(|| "OBJECTID".to_string())
    }

    pub fn max_records(&self) -> Option<usize> {
        self.max_record_count
            .or(self.standard_max_record_count)
            .filter(|n| *n > 0)
    }
}

#[derive(Debug, Deserialize)]
struct QueryReply {
    #[serde(default)]
    features: Vec<RawFeature>,
    #[serde(default, rename = "exceededTransferLimit")]
    exceeded_transfer_limit: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct CountReply {
    count: usize,
}

/// Client for one ArcGIS feature layer.
#[derive(Debug)]
pub struct FeatureLayer<'s> {
    session: &'s Session,
    url: String,
    id_field: String,
}

impl<'s> FeatureLayer<'s> {
    pub fn new(session: &'s Session, url: &str) -> Self {
        Self {
            session,
            url: layer_base(url).to_string(),
            id_field: "OBJECTID".to_string(),
        }
    }

    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn info(&self) -> Result<LayerInfo, FetchError> {
        let info: LayerInfo = self
            .session
            .retry_policy()
            .run(|| self.session.get_json(&self.url, &[("f", "json".to_string())]))?;
        info!(
            name = info.name.as_deref().unwrap_or("(unnamed)"),
            max_record_count = ?info.max_records(),
            oid = %info.id_field(),
            "layer info"
        );
        Ok(info)
    }

    /// Total record count, used as the pagination hint.
    pub fn count(&self) -> Result<usize, FetchError> {
        let query_url = self.query_url();
        let reply: CountReply = self.session.retry_policy().run(|| {
            self.session.get_json(
                &query_url,
                &[
                    ("f", "json".to_string()),
                    ("where", "1=1".to_string()),
                    ("returnCountOnly", "true".to_string()),
                ],
            )
        })?;
        Ok(reply.count)
    }

    fn query_url(&self) -> String {
        urljoin(&self.url, "query")
    }
}

impl PageSource for FeatureLayer<'_> {
    type Item = RawFeature;

    fn fetch_page(&self, req: &PageRequest) -> Attempt<Page<RawFeature>> {
        let query_url = self.query_url();
        let params = [
            ("f", "json".to_string()),
            ("where", "1=1".to_string()),
            // All fields; the service decides what actually exists.
            ("outFields", "*".to_string()),
            ("returnGeometry", "false".to_string()),
            ("orderByFields", format!("{} ASC", self.id_field)),
            ("resultOffset", req.offset.to_string()),
            ("resultRecordCount", req.limit.to_string()),
        ];
        self.session
            .get_json::<QueryReply>(&query_url, &params)
            .map(|reply| Page {
                items: reply.features,
                more: reply.exceeded_transfer_limit,
            })
    }
}

#[derive(Debug, Deserialize)]
struct GeometryFeature {
    #[serde(default)]
    attributes: crate::feature::Attributes,
    #[serde(default)]
    geometry: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GeometryReply {
    #[serde(default)]
    features: Vec<GeometryFeature>,
}

impl GeometrySource for FeatureLayer<'_> {
    fn fetch_geometries(&self, ids: &[i64]) -> Result<HashMap<i64, Value>, FetchError> {
        let query_url = self.query_url();
        let joined = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let params = [
            ("f", "json".to_string()),
            ("objectIds", joined),
            ("outFields", self.id_field.clone()),
            ("returnGeometry", "true".to_string()),
            ("outSR", "4326".to_string()),
        ];
        let reply: GeometryReply = self
            .session
            .retry_policy()
            .run(|| self.session.get_json(&query_url, &params))?;

        Ok(reply
            .features
            .into_iter()
            .filter_map(|f| {
                let id = crate::feature::object_id_of(&f.attributes, &self.id_field)?;
                Some((id, f.geometry?))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_info_fallbacks() {
        let info: LayerInfo = serde_json::from_str(
            r#"{"name":"DPWH_Flood_Control_Projects","objectIdFieldName":"FID","standardMaxRecordCount":4000,"fields":[{"name":"X"}]}"#,
        )
        .unwrap();
        assert_eq!(info.id_field(), "FID");
        assert_eq!(info.max_records(), Some(4000));

        let bare: LayerInfo = serde_json::from_str(r#"{"fields":[{"name":"OID"}],"maxRecordCount":0}"#).unwrap();
        assert_eq!(bare.id_field(), "OID");
        assert_eq!(bare.max_records(), None);
        assert_eq!(LayerInfo::default().id_field(), "OBJECTID");
    }

    #[test]
    fn query_reply_reads_transfer_limit() {
        let reply: QueryReply = serde_json::from_str(
            r#"{"objectIdFieldName":"OBJECTID","features":[{"attributes":{"OBJECTID":1}}],"exceededTransferLimit":true}"#,
        )
        .unwrap();
        assert_eq!(reply.features.len(), 1);
        assert_eq!(reply.exceeded_transfer_limit, Some(true));
    }
}
