use std::path::PathBuf;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::backfill::backfill;
use crate::config::Config;
use crate::dataset::{Dataset, Source};
use crate::enrich::enrich_rows;
use crate::error::{FetchError, PipelineError};
use crate::export::Exporter;
use crate::fallback::load_static;
use crate::feature::RawFeature;
use crate::listing::fetch_listing;
use crate::mapper::{full_row, map_feature};
use crate::paginator::Paginator;
use crate::service::FeatureLayer;
use crate::session::Session;

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct Report {
    pub source: Source,
    pub rows_written: usize,
    pub missing_coordinates: usize,
    /// `None` when the source could not provide the full export.
    pub full_rows: Option<usize>,
    pub files: Vec<PathBuf>,
    /// Full exports from an earlier run that this run did not replace.
    pub stale_files: Vec<PathBuf>,
}

/// Fetches, backfills and exports the dataset.
///
/// Errors wrapping [`PipelineError`] carry their own exit code; anything else
/// is a setup failure.
pub fn run(config: &Config) -> Result<Report> {
    let report = Session::scoped(config, |session| -> Result<Report, PipelineError> {
        let ds = collect(session, config)?;
        let summary = Exporter::new(&config.out_dir).write(&ds)?;
        Ok(Report {
            missing_coordinates: ds.missing_coordinates(),
            rows_written: summary.rows,
            full_rows: summary.full_rows,
            files: summary.files,
            stale_files: summary.stale,
            source: ds.source,
        })
    })??;
    Ok(report)
}

/// Tries each source in order and returns the first non-empty dataset.
pub fn collect(session: &Session, config: &Config) -> Result<Dataset, PipelineError> {
    let mut last = String::from("no source enabled");

    if config.force_fallback {
        info!("fallback forced; skipping live sources");
    } else {
        for url in &config.layer_urls {
            info!(layer = %url, "fetching feature layer");
            match fetch_layer(session, config, url) {
                Ok(ds) if !ds.rows.is_empty() => return Ok(ds),
                Ok(_) => {
                    warn!(layer = %url, "layer returned no features");
                    last = format!("{}: no features", url);
                }
                Err(e) => {
                    warn!(layer = %url, error = %e, "layer failed");
                    last = e.to_string();
                }
            }
        }

        if config.use_listing {
            match fetch_listing(session, config) {
                Ok((ajax_url, mut rows)) if !rows.is_empty() => {
                    enrich_rows(&mut rows, config);
                    return Ok(Dataset {
                        rows,
                        full: None,
                        source: Source::Listing(ajax_url),
                    });
                }
                Ok((ajax_url, _)) => {
                    warn!(url = %ajax_url, "listing returned no rows");
                    last = format!("{}: no rows", ajax_url);
                }
                Err(e) => {
                    warn!(error = %e, "listing failed");
                    last = e.to_string();
                }
            }
        }
    }

    if config.use_fallback {
        match load_static(session, &config.fallback_url) {
            Ok(ds) if !ds.rows.is_empty() => return Ok(ds),
            Ok(_) => last = format!("{}: no features", config.fallback_url),
            Err(e) => {
                warn!(error = %e, "static fallback failed");
                last = e.to_string();
            }
        }
    }

    Err(PipelineError::AllSourcesFailed { last })
}

/// Pages through one layer, maps every feature and backfills coordinates.
pub fn fetch_layer(session: &Session, config: &Config, url: &str) -> Result<Dataset, FetchError> {
    let layer = FeatureLayer::new(session, url);
    let info = layer.info()?;
    let id_field = info.id_field();
    let layer = layer.with_id_field(id_field.clone());

    let page_size = info
        .max_records()
        .map_or(config.page_size, |max| max.min(config.page_size));
    let total = match layer.count() {
        Ok(n) => {
            info!(count = n, "layer record count");
            Some(n)
        }
        Err(e) => {
            debug!(error = %e, "count query unsupported; paging without a hint");
            None
        }
    };

    let features = Paginator::new(page_size, session.retry_policy().clone())
        .with_total_hint(total)
        .with_max_pages(config.max_pages)
        .with_progress(config.progress)
        .run(&layer, |f: &RawFeature| f.object_id(&id_field))?;

    let mut rows = Vec::with_capacity(features.len());
    let mut full = Vec::with_capacity(features.len());
    for f in &features {
        let row = map_feature(&f.attributes, f.object_id(&id_field));
        full.push(full_row(&f.attributes, &row));
        rows.push(row);
    }

    backfill(&layer, &mut rows, Some(full.as_mut_slice()));

    Ok(Dataset {
        rows,
        full: Some(full),
        source: Source::FeatureLayer(layer.url().to_string()),
    })
}
