use std::collections::HashMap;

use serde_json::Value;
use tracing::{info, warn};

use crate::dataset::{FullRow, ProjectRow};
use crate::error::{FetchError, GeometryLookupError};
use crate::feature::{Coord, Geometry};

/// Largest id list sent in one geometry query; keeps URLs within server limits.
pub const GEOMETRY_CHUNK: usize = 500;

/// Looks up WGS84 geometries by object id.
pub trait GeometrySource {
    /// Returns raw geometry JSON for the ids the service knows about.
    fn fetch_geometries(&self, ids: &[i64]) -> Result<HashMap<i64, Value>, FetchError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackfillReport {
    /// Rows that needed coordinates and had an id to look them up by.
    pub requested: usize,
    pub filled: usize,
    pub failed: usize,
}

/// Fills missing `lat`/`lng` from geometry lookups.
///
/// `full`, when given, must be parallel to `rows`; its `lat`/`lng` and blank
/// `Latitude`/`Longitude` attributes are updated alongside. Lookup failures are
/// logged and leave the coordinates null.
pub fn backfill<G>(source: &G, rows: &mut [ProjectRow], mut full: Option<&mut [FullRow]>) -> BackfillReport
where
    G: GeometrySource + ?Sized,
{
    let mut positions: HashMap<i64, Vec<usize>> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        if row.has_coordinates() {
            continue;
        }
        if let Some(id) = row.object_id {
            positions.entry(id).or_default().push(i);
        }
    }

    let mut ids: Vec<i64> = positions.keys().copied().collect();
    ids.sort_unstable();

    let mut report = BackfillReport {
        requested: ids.len(),
        ..Default::default()
    };
    if ids.is_empty() {
        return report;
    }
    info!(rows = ids.len(), "backfilling geometry for rows without lat/lng");

    for chunk in ids.chunks(GEOMETRY_CHUNK) {
        let found = match source.fetch_geometries(chunk) {
            Ok(found) => found,
            Err(e) => {
                let err = GeometryLookupError::Request {
                    count: chunk.len(),
                    source: e,
                };
                warn!(error = %err, "geometry lookup failed");
                report.failed += chunk.len();
                continue;
            }
        };

        for id in chunk {
            let point = match found.get(id) {
                None => Err(GeometryLookupError::Missing(*id)),
                Some(raw) => Geometry::from_esri(raw)
                    .and_then(|g| g.representative_point())
                    .ok_or(GeometryLookupError::Empty(*id)),
            };
            match point {
                Ok(p) => {
                    for &i in &positions[id] {
                        apply(&mut rows[i], full.as_deref_mut().and_then(|f| f.get_mut(i)), p);
                    }
                    report.filled += 1;
                }
                Err(err) => {
                    warn!(error = %err, "geometry lookup failed");
                    report.failed += 1;
                }
            }
        }
    }

    info!(filled = report.filled, failed = report.failed, "geometry backfill finished");
    report
}

fn apply(row: &mut ProjectRow, full: Option<&mut FullRow>, p: Coord) {
    row.lng = Some(p.x);
    row.lat = Some(p.y);
    if let Some(full) = full {
        full.insert("lng".to_string(), Value::from(p.x));
        full.insert("lat".to_string(), Value::from(p.y));
        for (key, v) in [("Longitude", p.x), ("Latitude", p.y)] {
            let blank = match full.get(key) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.trim().is_empty(),
                Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f == 0.0),
                _ => false,
            };
            if blank {
                full.insert(key.to_string(), Value::from(v));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    struct FakeGeometry {
        known: HashMap<i64, Value>,
        calls: RefCell<Vec<usize>>,
        fail: bool,
    }

    impl GeometrySource for FakeGeometry {
        fn fetch_geometries(&self, ids: &[i64]) -> Result<HashMap<i64, Value>, FetchError> {
            self.calls.borrow_mut().push(ids.len());
            if self.fail {
                return Err(FetchError::Status {
                    url: "u".into(),
                    status: 500,
                });
            }
            Ok(ids
                .iter()
                .filter_map(|id| self.known.get(id).map(|g| (*id, g.clone())))
                .collect())
        }
    }

    fn row(id: i64, lat: Option<f64>, lng: Option<f64>) -> ProjectRow {
        ProjectRow {
            object_id: Some(id),
            lat,
            lng,
            ..Default::default()
        }
    }

    #[test]
    fn fills_points_and_leaves_unknown_null() {
        let src = FakeGeometry {
            known: HashMap::from([
                (2, json!({"x": 121.5, "y": 14.25})),
                (3, json!({"x": null, "y": null})),
            ]),
            calls: RefCell::new(vec![]),
            fail: false,
        };
        let mut rows = vec![
            row(1, Some(10.0), Some(120.0)),
            row(2, None, None),
            row(3, None, None),
            row(4, None, Some(123.0)),
        ];
        let mut full: Vec<FullRow> = rows
            .iter()
            .map(|_| json!({"Latitude": "", "Longitude": 99.0}).as_object().cloned().unwrap())
            .collect();

        let report = backfill(&src, &mut rows, Some(full.as_mut_slice()));

        assert_eq!(report, BackfillReport { requested: 3, filled: 1, failed: 2 });
        assert_eq!(rows[1].lat, Some(14.25));
        assert_eq!(rows[1].lng, Some(121.5));
        assert_eq!(rows[0].lat, Some(10.0));
        assert!(!rows[2].has_coordinates());
        assert_eq!(full[1]["lat"], json!(14.25));
        assert_eq!(full[1]["Latitude"], json!(14.25));
        // Populated source attribute is left alone.
        assert_eq!(full[1]["Longitude"], json!(99.0));
        assert!(full[2].get("lat").is_none());
    }

    #[test]
    fn polygon_geometry_uses_centroid() {
        let src = FakeGeometry {
            known: HashMap::from([(5, json!({"rings": [[[120.0, 10.0], [122.0, 10.0], [122.0, 12.0], [120.0, 12.0], [120.0, 10.0]]]}))]),
            calls: RefCell::new(vec![]),
            fail: false,
        };
        let mut rows = vec![row(5, None, None)];
        backfill(&src, &mut rows, None);
        assert!((rows[0].lat.unwrap() - 11.0).abs() < 1e-9);
        assert!((rows[0].lng.unwrap() - 121.0).abs() < 1e-9);
    }

    #[test]
    fn request_failure_is_not_fatal() {
        let src = FakeGeometry {
            known: HashMap::new(),
            calls: RefCell::new(vec![]),
            fail: true,
        };
        let mut rows: Vec<ProjectRow> = (0..(GEOMETRY_CHUNK as i64 + 1)).map(|i| row(i, None, None)).collect();
        let report = backfill(&src, &mut rows, None);
        assert_eq!(report.failed, GEOMETRY_CHUNK + 1);
        assert_eq!(*src.calls.borrow(), vec![GEOMETRY_CHUNK, 1]);
        assert!(rows.iter().all(|r| !r.has_coordinates()));
    }

    #[test]
    fn rows_without_id_are_not_requested() {
        let src = FakeGeometry {
            known: HashMap::new(),
            calls: RefCell::new(vec![]),
            fail: false,
        };
        let mut rows = vec![ProjectRow::default()];
        let report = backfill(&src, &mut rows, None);
        assert_eq!(report, BackfillReport::default());
        assert!(src.calls.borrow().is_empty());
    }
}
