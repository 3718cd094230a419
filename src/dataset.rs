use std::fmt;

use serde::{Deserialize, Serialize};

use crate::feature::Attributes;

/// Fixed-shape project record written to the "Raw" export.
///
/// Field order is the column order of the CSV file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectRow {
    pub object_id: Option<i64>,
    pub project_id: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub contractor: Option<String>,
    pub cost: Option<String>,
    pub completion_date: Option<String>,
    pub report_contract_id: Option<String>,
    pub start_date: Option<String>,
    pub project_type: Option<String>,
    pub funding_year: Option<String>,
    pub report_year: Option<String>,
    pub region: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

impl ProjectRow {
    pub fn has_coordinates(&self) -> bool {
        self.lat.is_some() && self.lng.is_some()
    }

    /// Dedup key for rows that have no object id.
    pub fn listing_key(&self) -> Option<String> {
        if self.project_id.is_none() && self.report_contract_id.is_none() {
            return None;
        }
        // Composite: distinct items may share a contract id.
        Some(format!(
            "pid:{}|rcid:{}",
            self.project_id.as_deref().unwrap_or(""),
            self.report_contract_id.as_deref().unwrap_or("")
        ))
    }
}

/// All source attributes plus derived `object_id`, `lat` and `lng`.
pub type FullRow = Attributes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    FeatureLayer(String),
    Listing(String),
    StaticDataset(String),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::FeatureLayer(url) => write!(f, "feature layer {}", url),
            Source::Listing(url) => write!(f, "listing endpoint {}", url),
            Source::StaticDataset(url) => write!(f, "static dataset {}", url),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub rows: Vec<ProjectRow>,
    /// Parallel to `rows`; `None` when the source has no per-attribute schema.
    pub full: Option<Vec<FullRow>>,
    pub source: Source,
}

impl Dataset {
    pub fn missing_coordinates(&self) -> usize {
        self.rows.iter().filter(|r| !r.has_coordinates()).count()
    }
}
