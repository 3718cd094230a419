use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::dataset::{Dataset, FullRow, ProjectRow};
use crate::error::WriteError;

pub const RAW_JSON: &str = "Flood Control Projects Raw.json";
pub const RAW_CSV: &str = "Flood Control Projects Raw.csv";
pub const FULL_JSON: &str = "Flood Control Projects Full.json";
pub const FULL_CSV: &str = "Flood Control Projects Full.csv";

/// CSV header; must follow the field order of [`ProjectRow`].
const RAW_COLUMNS: [&str; 15] = [
    "object_id",
    "project_id",
    "description",
    "location",
    "contractor",
    "cost",
    "completion_date",
    "report_contract_id",
    "start_date",
    "project_type",
    "funding_year",
    "report_year",
    "region",
    "lat",
    "lng",
];

#[derive(Debug, Clone, Default)]
pub struct ExportSummary {
    pub files: Vec<PathBuf>,
    pub rows: usize,
    /// `None` when the dataset had no full-attribute rows.
    pub full_rows: Option<usize>,
    /// Full exports from an earlier run left in place because this dataset had none.
    pub stale: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Exporter {
    out_dir: PathBuf,
}

impl Exporter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.out_dir.join(name)
    }

    /// Writes the raw export and, when available, the full export.
    ///
    /// Each file is replaced atomically; a failure leaves earlier files written
    /// and the failing target untouched.
    pub fn write(&self, ds: &Dataset) -> Result<ExportSummary, WriteError> {
        let mut summary = ExportSummary {
            rows: ds.rows.len(),
            ..Default::default()
        };

        let p = self.path(RAW_JSON);
        write_rows_json(&p, &ds.rows)?;
        summary.files.push(p);
        let p = self.path(RAW_CSV);
        write_rows_csv(&p, &ds.rows)?;
        summary.files.push(p);

        match &ds.full {
            Some(full) => {
                let p = self.path(FULL_JSON);
                write_full_json(&p, full)?;
                summary.files.push(p);
                let p = self.path(FULL_CSV);
                write_full_csv(&p, full)?;
                summary.files.push(p);
                summary.full_rows = Some(full.len());
            }
            None => {
                summary.stale = [FULL_JSON, FULL_CSV]
                    .iter()
                    .map(|name| self.path(name))
                    .filter(|p| p.exists())
                    .collect();
                if summary.stale.is_empty() {
                    warn!(source = %ds.source, "source has no full attributes; full export skipped");
                } else {
                    let stale: Vec<String> = summary.stale.iter().map(|p| p.display().to_string()).collect();
                    warn!(
                        source = %ds.source,
                        stale = %stale.join(", "),
                        "source has no full attributes; full export skipped, older full files were not updated"
                    );
                }
            }
        }

        for f in &summary.files {
            info!(path = %f.display(), "wrote");
        }
        Ok(summary)
    }
}

pub fn write_rows_json(path: &Path, rows: &[ProjectRow]) -> Result<(), WriteError> {
    write_atomic(path, |out| {
        serde_json::to_writer_pretty(out, rows).map_err(|source| WriteError::Json {
            path: path.to_path_buf(),
            source,
        })
    })
}

pub fn write_rows_csv(path: &Path, rows: &[ProjectRow]) -> Result<(), WriteError> {
    let csv_err = |source| WriteError::Csv {
        path: path.to_path_buf(),
        source,
    };
    write_atomic(path, |out| {
        // Header written by hand so an empty dataset still gets one.
        let mut w = csv::WriterBuilder::new().has_headers(false).from_writer(out);
        w.write_record(RAW_COLUMNS).map_err(csv_err)?;
        for row in rows {
            w.serialize(row).map_err(csv_err)?;
        }
        w.flush().map_err(|source| WriteError::Io {
            path: path.to_path_buf(),
            source,
        })
    })
}

pub fn write_full_json(path: &Path, rows: &[FullRow]) -> Result<(), WriteError> {
    write_atomic(path, |out| {
        serde_json::to_writer_pretty(out, rows).map_err(|source| WriteError::Json {
            path: path.to_path_buf(),
            source,
        })
    })
}

/// Columns are the union of all keys, in first-seen order.
pub fn write_full_csv(path: &Path, rows: &[FullRow]) -> Result<(), WriteError> {
    let columns = full_columns(rows);
    let csv_err = |source| WriteError::Csv {
        path: path.to_path_buf(),
        source,
    };
    write_atomic(path, |out| {
        let mut w = csv::WriterBuilder::new().has_headers(false).from_writer(out);
        if !columns.is_empty() {
            w.write_record(&columns).map_err(csv_err)?;
        }
        for row in rows {
            w.write_record(columns.iter().map(|c| row.get(c.as_str()).map(cell_text).unwrap_or_default()))
                .map_err(csv_err)?;
        }
        w.flush().map_err(|source| WriteError::Io {
            path: path.to_path_buf(),
            source,
        })
    })
}

fn full_columns(rows: &[FullRow]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for row in rows {
        for k in row.keys() {
            if seen.insert(k.as_str()) {
                columns.push(k.clone());
            }
        }
    }
    columns
}

fn cell_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Writes to a temporary sibling file, then renames it over `path`.
fn write_atomic<F>(path: &Path, write: F) -> Result<(), WriteError>
where
    F: FnOnce(&mut dyn Write) -> Result<(), WriteError>,
{
    let io_err = |source| WriteError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(io_err)?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    {
        let mut out = BufWriter::new(tmp.as_file_mut());
        write(&mut out)?;
        out.flush().map_err(io_err)?;
    }
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|source| WriteError::Persist {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

pub fn read_rows_json(path: &Path) -> Result<Vec<ProjectRow>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse {}", path.display()))
}

pub fn read_rows_csv(path: &Path) -> Result<Vec<ProjectRow>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("failed to open {}", path.display()))?;
    reader
        .deserialize::<ProjectRow>()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse {}", path.display()))
}
