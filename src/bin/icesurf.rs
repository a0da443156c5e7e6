//! Command-line entry point for the ice surface classification pipeline

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use icesurf::config::compact_dates;
use icesurf::{Pipeline, PipelineConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "icesurf", version, about = "Classify Sentinel-2 ice surfaces and estimate albedo")]
struct Args {
    /// JSON run configuration
    #[arg(short, long)]
    config: PathBuf,

    /// Only process these tiles (must be configured)
    #[arg(short, long)]
    tile: Vec<String>,

    /// Only process these dates, YYYYMMDD or YYYY-MM-DD (must be configured)
    #[arg(short, long, value_parser = parse_date)]
    date: Vec<NaiveDate>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_date(s: &str) -> std::result::Result<NaiveDate, String> {
    compact_dates::parse(s).ok_or_else(|| format!("invalid date '{}'", s))
}

/// Keep only the requested entries of a configured list
fn restrict<T: PartialEq + std::fmt::Debug>(configured: &mut Vec<T>, wanted: &[T], what: &str) -> Result<()> {
    if wanted.is_empty() {
        return Ok(());
    }
    if let Some(missing) = wanted.iter().find(|w| !configured.contains(w)) {
        bail!("{} {:?} is not in the configuration", what, missing);
    }
    configured.retain(|c| wanted.contains(c));
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = PipelineConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration {}", args.config.display()))?;
    restrict(&mut config.tiles, &args.tile, "tile")?;
    restrict(&mut config.dates, &args.date, "date")?;

    let mut pipeline = Pipeline::from_config(config).context("Failed to set up pipeline")?;
    let report = pipeline.run().context("Pipeline run failed")?;

    println!(
        "{} processed, {} incomplete, {} rejected by quality, {} failed",
        report.processed.len(),
        report.download_skipped.len(),
        report.quality_skipped.len(),
        report.failed.len()
    );
    Ok(())
}
