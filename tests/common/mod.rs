//! Mock endpoints for integration tests.
//!
//! `floodfetch` uses the blocking reqwest client, which must not run inside an
//! async context. The mock server therefore lives on its own runtime and the
//! tests call into the crate from the plain test thread.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use floodfetch::Config;
use serde_json::{Value, json};
use tokio::runtime::Runtime;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const LAYER_PATH: &str = "/FeatureServer/0";
pub const GEOJSON_PATH: &str = "/projects.geojson";
pub const AJAX_PATH: &str = "/wp-admin/admin-ajax.php";

pub struct MockService {
    // Dropped before the runtime that drives it.
    server: MockServer,
    rt: Runtime,
}

impl MockService {
    pub fn start() -> Self {
        let rt = Runtime::new().unwrap();
        let server = rt.block_on(MockServer::start());
        Self { server, rt }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.server.uri(), path)
    }

    pub fn mount(&self, mock: Mock) {
        self.rt.block_on(mock.mount(&self.server));
    }

    /// Requests received so far, across all paths.
    pub fn hits(&self) -> usize {
        self.rt
            .block_on(self.server.received_requests())
            .map_or(0, |reqs| reqs.len())
    }

    /// Serves a feature layer at [`LAYER_PATH`].
    pub fn with_layer(self, layer: LayerFixture) -> Self {
        self.mount(
            Mock::given(method("GET"))
                .and(path(LAYER_PATH))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "name": "Flood Control Projects",
                    "objectIdField": "OBJECTID",
                    "maxRecordCount": layer.max_record_count,
                    "fields": [{"name": "OBJECTID"}]
                }))),
        );
        self.mount(
            Mock::given(method("GET"))
                .and(path(format!("{}/query", LAYER_PATH)))
                .respond_with(layer),
        );
        self
    }

    /// Serves a GeoJSON document at [`GEOJSON_PATH`].
    pub fn with_geojson(self, body: Value) -> Self {
        self.mount(
            Mock::given(method("GET"))
                .and(path(GEOJSON_PATH))
                .respond_with(ResponseTemplate::new(200).set_body_json(body)),
        );
        self
    }
}

/// Answers `/query` for record pages, count-only and `objectIds` lookups.
pub struct LayerFixture {
    pub features: Vec<Value>,
    pub geometries: HashMap<i64, Value>,
    pub max_record_count: usize,
}

impl Respond for LayerFixture {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let query: HashMap<String, String> = request.url.query_pairs().into_owned().collect();

        if query.get("returnCountOnly").map(String::as_str) == Some("true") {
            return ResponseTemplate::new(200).set_body_json(json!({"count": self.features.len()}));
        }
        if let Some(ids) = query.get("objectIds") {
            let found: Vec<Value> = ids
                .split(',')
                .filter_map(|id| id.trim().parse::<i64>().ok())
                .filter_map(|id| {
                    self.geometries
                        .get(&id)
                        .map(|g| json!({"attributes": {"OBJECTID": id}, "geometry": g}))
                })
                .collect();
            return ResponseTemplate::new(200).set_body_json(json!({"features": found}));
        }

        let number = |k: &str, default: usize| query.get(k).and_then(|v| v.parse().ok()).unwrap_or(default);
        let offset = number("resultOffset", 0);
        let limit = number("resultRecordCount", self.features.len());
        let page: Vec<Value> = self.features.iter().skip(offset).take(limit).cloned().collect();
        let more = offset + page.len() < self.features.len();
        ResponseTemplate::new(200).set_body_json(json!({"features": page, "exceededTransferLimit": more}))
    }
}

/// admin-ajax `filter_projects`: one `<tr>` per page, `has_more` until `pages`.
pub struct ListingFixture {
    pub nonce: String,
    pub pages: usize,
}

impl Respond for ListingFixture {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let form: HashMap<String, String> = url::form_urlencoded::parse(&request.body)
            .into_owned()
            .collect();
        if form.get("action").map(String::as_str) != Some("filter_projects")
            || form.get("nonce") != Some(&self.nonce)
        {
            return ResponseTemplate::new(200).set_body_json(json!({"success": false, "data": "bad nonce"}));
        }
        let page: usize = form.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
        let rows = format!(
            r#"<tr><td><a class="load-project-card" data-id="{p}01">Dike {p}</a></td><td>Apalit, Pampanga</td><td>ACME</td><td>₱1,000.00</td><td>2024-01-31</td></tr>"#,
            p = page
        );
        ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {"rows": rows, "has_more": page < self.pages}
        }))
    }
}

/// Config pointed at local endpoints with no pacing, no retry delay and no UI.
pub fn test_config(out_dir: PathBuf, layer_urls: Vec<String>, fallback_url: String) -> Config {
    Config {
        layer_urls,
        fallback_url,
        out_dir,
        retry_max: 2,
        retry_delay: Duration::ZERO,
        retry_delay_max: Duration::ZERO,
        throttle: Duration::ZERO,
        timeout: Duration::from_secs(10),
        use_listing: false,
        progress: false,
        ..Config::default()
    }
}

pub fn feature(id: i64, attrs: Value) -> Value {
    let mut a = attrs;
    a["OBJECTID"] = json!(id);
    json!({ "attributes": a })
}
