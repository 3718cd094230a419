use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::dataset::{Dataset, ProjectRow, Source};
use crate::error::FetchError;
use crate::feature::{Attributes, Geometry};
use crate::mapper::{normalize_row, text_of};
use crate::session::Session;

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<GeoFeature>,
}

#[derive(Debug, Deserialize)]
struct GeoFeature {
    #[serde(default)]
    properties: Option<Attributes>,
    #[serde(default)]
    geometry: Option<Value>,
}

/// Downloads the published GeoJSON dataset and reshapes it into project rows.
///
/// The static file has a narrower schema than the feature layer, so the
/// returned dataset carries no full-attribute rows.
pub fn load_static(session: &Session, url: &str) -> Result<Dataset, FetchError> {
    info!(url, "loading static fallback dataset");
    let collection: FeatureCollection = session
        .retry_policy()
        .run(|| session.get_json(url, &[]))?;
    let rows = rows_from_geojson(collection);
    info!(rows = rows.len(), "loaded static fallback dataset");
    Ok(Dataset {
        rows,
        full: None,
        source: Source::StaticDataset(url.to_string()),
    })
}

fn rows_from_geojson(collection: FeatureCollection) -> Vec<ProjectRow> {
    collection
        .features
        .into_iter()
        .map(|f| {
            let props = f.properties.unwrap_or_default();
            let mut row = map_properties(&props);
            if let Some(p) = f
                .geometry
                .as_ref()
                .and_then(Geometry::from_geojson)
                .and_then(|g| g.representative_point())
            {
                row.lng = Some(p.x);
                row.lat = Some(p.y);
            }
            normalize_row(&mut row);
            row
        })
        .collect()
}

/// Best-effort equivalent of the layer mapping for the published properties.
fn map_properties(props: &Attributes) -> ProjectRow {
    let get = |k: &str| props.get(k).and_then(text_of);
    let location = match (get("Municipality"), get("Province")) {
        (Some(m), Some(p)) => Some(format!("{}, {}", m, p)),
        (m, p) => m.or(p),
    };
    let year = get("InfraYear");
    ProjectRow {
        object_id: None,
        project_id: get("ContractID").or_else(|| get("GlobalID")),
        description: get("ProjectDescription"),
        location,
        contractor: get("Contractor"),
        cost: get("ContractCost"),
        completion_date: get("CompletionDate"),
        report_contract_id: get("ContractID"),
        start_date: get("StartDate"),
        project_type: get("TypeofWork"),
        funding_year: year.clone(),
        report_year: year,
        region: get("Region"),
        lat: None,
        lng: None,
    }
}
