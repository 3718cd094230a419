//! `floodfetch`: fetch the flood control project dataset into `data/`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use floodfetch::{Overrides, PipelineError, load_config, pipeline};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "floodfetch")]
#[command(about = "Fetch flood control project records and export them to JSON/CSV", long_about = None)]
#[command(version)]
struct Cli {
    /// Records requested per page (capped by the layer's maxRecordCount)
    #[arg(long)]
    page_size: Option<usize>,

    /// Directory the four export files are written to
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// Feature layer URL to try; repeat for several (replaces the defaults)
    #[arg(long = "layer-url")]
    layer_urls: Vec<String>,

    /// Safety cap on pages fetched from any source
    #[arg(long)]
    max_pages: Option<usize>,

    /// Skip live sources and load the published static dataset
    #[arg(long, conflicts_with = "no_fallback")]
    force_fallback: bool,

    /// Never use the published static dataset
    #[arg(long)]
    no_fallback: bool,

    /// Do not try the admin-ajax listing when the layers fail
    #[arg(long)]
    no_listing: bool,

    /// Hide the page progress spinner
    #[arg(long)]
    no_progress: bool,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let overrides = Overrides {
        layer_urls: cli.layer_urls,
        out_dir: cli.out_dir,
        page_size: cli.page_size,
        max_pages: cli.max_pages,
        force_fallback: cli.force_fallback,
        no_fallback: cli.no_fallback,
        no_listing: cli.no_listing,
        no_progress: cli.no_progress,
    };

    let config = match load_config(overrides) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "invalid configuration");
            return ExitCode::from(1);
        }
    };

    match pipeline::run(&config) {
        Ok(report) => {
            println!("Source: {}", report.source);
            println!(
                "Wrote {} rows ({} without coordinates)",
                report.rows_written, report.missing_coordinates
            );
            if report.full_rows.is_none() {
                println!("Full export skipped: source has no per-attribute data");
                for f in &report.stale_files {
                    println!("  not updated: {}", f.display());
                }
            }
            for f in &report.files {
                println!("- {}", f.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "run failed; existing outputs left untouched");
            let code = e
                .downcast_ref::<PipelineError>()
                .map(PipelineError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}
