//! Delete command - remove every artifact of a tile.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use treewatch_core::{ArtifactStore, IntervalId, InvalidImageLedger};
use treewatch_metrics::{metric_defs, TileLabels};
use treewatch_raster::TileId;

use crate::context::Components;
use crate::{print_json, OutputFormat};

/// Arguments for the delete command.
#[derive(Debug, Args)]
pub struct DeleteArgs {
    /// Tile ID, e.g. 105W_40N.
    pub tile: TileId,

    /// Also drop the tile's rejection records so the next ingest retries them.
    #[arg(long)]
    pub forget_rejections: bool,
}

/// What was removed for one interval.
#[derive(Debug, Serialize)]
struct Deleted {
    interval: IntervalId,
    artifacts: usize,
}

/// Execute the delete command.
///
/// # Errors
///
/// Returns an error if the store or ledger cannot be listed. Failures on one
/// interval are reported and the rest still run.
pub fn execute(args: DeleteArgs, components: &Components, format: OutputFormat) -> Result<()> {
    let labels = TileLabels::new(args.tile.as_str());
    let mut deleted = Vec::new();
    let mut failed = 0usize;

    for interval in components.store.list_intervals(&args.tile)? {
        match components.store.delete_all(&args.tile, interval) {
            Ok(artifacts) => {
                metrics::counter!(metric_defs::ARTIFACTS_DELETED.name, &labels.to_labels())
                    .increment(artifacts as u64);
                deleted.push(Deleted { interval, artifacts });
            }
            Err(e) => {
                tracing::warn!(tile = %args.tile, interval, error = %e, "failed to delete artifacts");
                failed += 1;
            }
        }
    }

    let mut forgotten = 0usize;
    if args.forget_rejections {
        for record in components.ledger.list(&args.tile)? {
            if components.ledger.clear(&args.tile, record.interval)? {
                forgotten += 1;
            }
        }
    }
    tracing::info!(tile = %args.tile, intervals = deleted.len(), failed, forgotten, "deleted tile");

    match format {
        OutputFormat::Json => print_json(&deleted)?,
        OutputFormat::Text => {
            for entry in &deleted {
                println!("{} {:>5}  deleted {} artifacts", args.tile, entry.interval, entry.artifacts);
            }
            println!(
                "{}: {} intervals deleted, {} failed, {} rejections forgotten",
                args.tile,
                deleted.len(),
                failed,
                forgotten
            );
        }
    }
    Ok(())
}
