//! Fetches the public flood control project dataset and exports it to JSON and CSV.
//!
//! The primary source is an ArcGIS feature layer, paged through with
//! `resultOffset`/`resultRecordCount`. Rows without coordinates are backfilled
//! from a geometry query. If every candidate layer fails, the site's
//! admin-ajax listing is tried (its rows filled in from an earlier export
//! when one is on disk), and then a previously published GeoJSON dataset.
//!
//! ## Quick start
//!
//! ```no_run
//! use anyhow::Result;
//! use floodfetch::{Config, pipeline};
//!
//! fn main() -> Result<()> {
//!     let config = Config {
//!         out_dir: "data".into(),
//!         progress: false,
//!         ..Config::default()
//!     };
//!     let report = pipeline::run(&config)?;
//!     println!(
//!         "{} rows from {} ({} without coordinates)",
//!         report.rows_written, report.source, report.missing_coordinates
//!     );
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod backfill;
mod config;
mod dataset;
pub mod enrich;
mod error;
pub mod export;
pub mod fallback;
pub mod feature;
pub mod listing;
pub mod mapper;
pub mod paginator;
pub mod pipeline;
pub mod retry;
mod service;
mod session;
mod util;

pub use config::{Config, Overrides, load_config};
pub use dataset::{Dataset, FullRow, ProjectRow, Source};
pub use error::{FetchError, GeometryLookupError, PipelineError, WriteError};
pub use service::{FeatureLayer, LayerInfo};
pub use session::{Session, is_certificate_error};
