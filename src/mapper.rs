//! Raw attributes to [`ProjectRow`]. Pure and total: missing fields become `None`.

use serde_json::Value;

use crate::dataset::{FullRow, ProjectRow};
use crate::feature::Attributes;

const COST_KEYS: &[&str] = &["ContractCost_String", "ABC_String", "ContractCost", "ABC"];
/// Priority order when more than one year attribute is populated.
const YEAR_KEYS: &[&str] = &["FundingYear", "infra_year", "InfraYear"];
const LAT_KEYS: &[&str] = &["lat", "Latitude"];
const LNG_KEYS: &[&str] = &["lng", "Longitude"];

const PLACEHOLDERS: &[&str] = &["none", "null", "n/a", "-", "\u{2014}"];

const NCR: &str = "National Capital Region";
const NCR_CITIES: &[&str] = &["CITY OF MANILA", "MANILA", "QUEZON CITY", "CALOOCAN", "PASIG", "MAKATI"];

pub fn map_feature(attrs: &Attributes, object_id: Option<i64>) -> ProjectRow {
    let year = first_text(attrs, YEAR_KEYS);
    ProjectRow {
        object_id,
        project_id: first_text(attrs, &["ProjectID"]),
        description: first_text(attrs, &["ProjectDescription"]),
        location: first_text(attrs, &["Province"]),
        contractor: first_text(attrs, &["Contractor"]),
        cost: first_text(attrs, COST_KEYS),
        completion_date: first_text(attrs, &["CompletionDateActual"]),
        report_contract_id: first_text(attrs, &["ContractID"]),
        start_date: first_text(attrs, &["StartDate"]),
        project_type: first_text(attrs, &["TypeofWork"]),
        // The layer has no report year of its own.
        report_year: year.clone(),
        funding_year: year,
        region: first_text(attrs, &["Region"]),
        lat: first_coordinate(attrs, LAT_KEYS),
        lng: first_coordinate(attrs, LNG_KEYS),
    }
}

/// Source attributes with `object_id`, `lat` and `lng` added when absent.
pub fn full_row(attrs: &Attributes, row: &ProjectRow) -> FullRow {
    let mut full = attrs.clone();
    full.entry("object_id").or_insert_with(|| Value::from(row.object_id));
    full.entry("lat").or_insert_with(|| Value::from(row.lat));
    full.entry("lng").or_insert_with(|| Value::from(row.lng));
    full
}

/// Clears placeholder text and fills an obvious region from the location.
pub fn normalize_row(row: &mut ProjectRow) {
    for field in [
        &mut row.project_id,
        &mut row.description,
        &mut row.location,
        &mut row.contractor,
        &mut row.cost,
        &mut row.completion_date,
        &mut row.report_contract_id,
        &mut row.start_date,
        &mut row.project_type,
        &mut row.funding_year,
        &mut row.report_year,
        &mut row.region,
    ] {
        if field.as_deref().is_some_and(is_placeholder) {
            *field = None;
        }
    }

    if row.region.is_none() {
        if let Some(loc) = row.location.as_deref() {
            let loc = loc.to_uppercase();
            if NCR_CITIES.iter().any(|c| loc.contains(c)) {
                row.region = Some(NCR.to_string());
            }
        }
    }
}

fn is_placeholder(s: &str) -> bool {
    let s = s.trim();
    s.is_empty() || PLACEHOLDERS.iter().any(|p| s.eq_ignore_ascii_case(p))
}

fn first_text(attrs: &Attributes, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| attrs.get(*k))
        .filter(|v| is_present(v))
        .find_map(text_of)
}

fn first_coordinate(attrs: &Attributes, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .filter_map(|k| attrs.get(*k))
        .find_map(coordinate_of)
}

/// Null, blank strings and numeric zero count as absent.
fn is_present(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

/// Renders a scalar attribute as text. Integral numbers have no fraction.
pub fn text_of(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() { None } else { Some(s.to_string()) }
        }
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                return Some(n.to_string());
            }
            let f = n.as_f64()?;
            if f.fract() == 0.0 && f.abs() < 1e15 {
                Some(format!("{:.0}", f))
            } else {
                Some(f.to_string())
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Numeric value taken as-is; numeric strings parsed. Zero is treated as unset.
pub fn coordinate_of(v: &Value) -> Option<f64> {
    let f = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !f.is_finite() || f.abs() < 1e-9 {
        return None;
    }
    Some(f)
}
