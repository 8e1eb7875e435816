//! Ingest command - fetch, validate and store a tile's raw imagery.

use anyhow::Result;
use clap::Args;
use treewatch_core::IntervalId;
use treewatch_raster::TileId;

use crate::context::Components;
use crate::{print_json, OutputFormat};

/// Arguments for the ingest command.
#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Tile ID, e.g. 105W_40N.
    pub tile: TileId,

    /// Clear previous rejections and try those intervals again.
    #[arg(long)]
    pub retry: bool,

    /// Ingest only these intervals instead of every eligible one.
    #[arg(long, short = 'i')]
    pub interval: Vec<IntervalId>,
}

/// Execute the ingest command.
///
/// # Errors
///
/// Returns an error if the registry cannot be loaded or the store or ledger
/// cannot be opened. Per-interval failures are reported, not returned.
pub fn execute(args: IngestArgs, components: &Components, format: OutputFormat) -> Result<()> {
    let intervals = if args.interval.is_empty() {
        let today = chrono::Utc::now().date_naive();
        let registry = components.registry(today)?;
        registry.eligible_intervals(components.settings.registry.lag_days, today)
    } else {
        let mut intervals = args.interval.clone();
        intervals.sort_unstable();
        intervals.dedup();
        intervals
    };
    tracing::info!(tile = %args.tile, intervals = intervals.len(), retry = args.retry, "ingesting tile");

    let pipeline = components.pipeline()?;
    let report = pipeline.ingest_tile(&args.tile, &intervals, args.retry);

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => {
            for (interval, outcome) in &report.outcomes {
                println!("{} {:>5}  {}", report.tile, interval, outcome);
            }
            println!(
                "{}: {} stored, {} present, {} skipped, {} rejected, {} failed",
                report.tile,
                report.count("stored"),
                report.count("already_present"),
                report.count("skipped_invalid"),
                report.count("rejected"),
                report.count("transient_error"),
            );
        }
    }
    Ok(())
}
