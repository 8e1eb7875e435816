//! Process command - derive composite or change products for a tile.

use anyhow::{Context as _, Result};
use clap::Args;
use treewatch_core::ProductLevel;
use treewatch_raster::TileId;

use crate::context::Components;
use crate::{print_json, OutputFormat};

/// Arguments for the process command.
#[derive(Debug, Args)]
pub struct ProcessArgs {
    /// Tile ID, e.g. 105W_40N.
    pub tile: TileId,

    /// Product to derive: composite (rgba) or change (treecover).
    pub level: ProductLevel,
}

/// Execute the process command.
///
/// # Errors
///
/// Returns an error if the level is `raw`, the tile has no raw imagery, or
/// reading or publishing fails.
pub fn execute(args: ProcessArgs, components: &Components, format: OutputFormat) -> Result<()> {
    let processor = components.processor();
    let report = processor
        .process(&args.tile, args.level)
        .with_context(|| format!("failed to process {} for {}", args.level, args.tile))?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => {
            for (interval, bytes) in &report.published {
                println!("{} {:>5}  {} published ({} bytes)", report.tile, interval, report.level, bytes);
            }
            println!("{}: {} {} artifacts", report.tile, report.published.len(), report.level);
        }
    }
    Ok(())
}
