//! Fills gaps in listing rows from an earlier export.
//!
//! Listing rows carry no dates, years or coordinates. A previous run's CSV
//! (a hand-cleaned copy if present, else the last raw export) usually does, keyed
//! by project id or contract id. Values are only copied into empty fields.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dataset::ProjectRow;
use crate::export::RAW_CSV;
use crate::mapper::{coordinate_of, normalize_row};

/// Manually cleaned export, preferred over the raw one when both exist.
pub const CLEANED_CSV: &str = "Flood Control Projects Cleaned.csv";

static WORK_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(construction|installation|rehab|mitigation|flood|drainage|slope|bank|protection|line canal|pump|booster)\b",
    )
    .expect("work pattern should be valid")
});
static REGION_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(region|ncr|caraga|car|iv-a|iv-b|iv|v|vi|vii|viii|ix|x|xi|xii|xiii|i|ii|iii|national capital)\b",
    )
    .expect("region pattern should be valid")
});

/// Known values by project id and by contract id.
#[derive(Debug, Default, Clone)]
pub struct Enrichment {
    by_key: HashMap<String, ProjectRow>,
}

impl Enrichment {
    /// Reads any CSV with a header row; only the recognised columns are used.
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut by_key = HashMap::new();
        for record in reader.deserialize::<HashMap<String, String>>() {
            let record = record.with_context(|| format!("failed to parse {}", path.display()))?;
            let get = |k: &str| {
                record
                    .get(k)
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            };
            let coordinate = |k: &str| get(k).and_then(|v| coordinate_of(&Value::String(v)));

            let mut known = ProjectRow {
                start_date: get("start_date"),
                project_type: get("project_type"),
                funding_year: get("funding_year"),
                report_year: get("report_year"),
                region: get("region"),
                lat: coordinate("lat"),
                lng: coordinate("lng"),
                ..Default::default()
            };
            move_descriptive_region(&mut known);

            let pid = get("project_id").map(|v| normalize_key(&v));
            let rcid = get("report_contract_id");
            // Later records win.
            for key in [pid, rcid].into_iter().flatten() {
                by_key.insert(key, known.clone());
            }
        }
        Ok(Self { by_key })
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Copies known values into empty fields. Returns the number of rows matched.
    pub fn apply(&self, rows: &mut [ProjectRow]) -> usize {
        let mut matched = 0;
        for row in rows.iter_mut() {
            let Some(key) = row
                .project_id
                .as_deref()
                .or(row.report_contract_id.as_deref())
                .map(normalize_key)
            else {
                continue;
            };
            let Some(known) = self.by_key.get(&key) else {
                continue;
            };
            fill(&mut row.start_date, &known.start_date);
            fill(&mut row.project_type, &known.project_type);
            fill(&mut row.funding_year, &known.funding_year);
            fill(&mut row.report_year, &known.report_year);
            fill(&mut row.region, &known.region);
            fill(&mut row.lat, &known.lat);
            fill(&mut row.lng, &known.lng);
            matched += 1;
        }
        matched
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, known: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(known);
    }
}

/// Ids read back from spreadsheets may have gained a `.0`.
fn normalize_key(raw: &str) -> String {
    let s = raw.trim();
    match s.strip_suffix(".0") {
        Some(int) if !int.is_empty() && int.bytes().all(|b| b.is_ascii_digit()) => int.to_string(),
        _ => s.to_string(),
    }
}

/// A region holding a work description is moved to an empty `project_type`.
pub fn move_descriptive_region(row: &mut ProjectRow) {
    let Some(region) = row.region.as_deref().map(str::trim).filter(|r| !r.is_empty()) else {
        return;
    };
    if WORK_WORDS.is_match(region) && !REGION_WORDS.is_match(region) {
        if row.project_type.is_none() {
            row.project_type = Some(region.to_string());
        }
        row.region = None;
    }
}

fn enrichment_source(config: &Config) -> Option<PathBuf> {
    if let Some(p) = &config.enrich_csv {
        return Some(p.clone());
    }
    [CLEANED_CSV, RAW_CSV]
        .iter()
        .map(|name| config.out_dir.join(name))
        .find(|p| p.exists())
}

/// Enriches listing rows in place, then tidies regions. Returns rows matched.
///
/// A missing or unreadable source is logged and skipped.
pub fn enrich_rows(rows: &mut [ProjectRow], config: &Config) -> usize {
    let matched = match enrichment_source(config) {
        None => {
            debug!("no earlier export to enrich listing rows from");
            0
        }
        Some(path) => match Enrichment::load(&path) {
            Ok(known) => {
                let matched = known.apply(rows);
                info!(path = %path.display(), keys = known.len(), matched, "enriched listing rows");
                matched
            }
            Err(e) => {
                warn!(path = %path.display(), error = %format!("{:#}", e), "could not read enrichment source");
                0
            }
        },
    };
    for row in rows.iter_mut() {
        move_descriptive_region(row);
        normalize_row(row);
    }
    matched
}
