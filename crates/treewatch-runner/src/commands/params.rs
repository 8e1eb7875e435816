//! Params command - per-tile threshold overrides.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use treewatch_core::{ChangeParams, TileParamStore};
use treewatch_raster::TileId;

use crate::context::Components;
use crate::{print_json, OutputFormat};

/// Arguments for the params command.
#[derive(Debug, Args)]
pub struct ParamsArgs {
    /// Action to take.
    #[command(subcommand)]
    pub action: ParamsAction,
}

/// Params actions.
#[derive(Debug, Subcommand)]
pub enum ParamsAction {
    /// Show the effective thresholds of a tile.
    Show {
        /// Tile ID.
        tile: TileId,
    },
    /// Override thresholds for a tile.
    Set {
        /// Tile ID.
        tile: TileId,
        /// Minimum valid pixel fraction for ingestion.
        #[arg(long)]
        min_valid_fraction: Option<f64>,
        /// Drop below the running peak that counts as loss.
        #[arg(long)]
        cut_threshold: Option<f32>,
        /// Floor for the loss trigger.
        #[arg(long)]
        tree_lower_bound: Option<f32>,
    },
    /// Remove every override of a tile.
    Clear {
        /// Tile ID.
        tile: TileId,
    },
}

/// Effective thresholds of a tile.
#[derive(Debug, Serialize)]
struct Effective {
    tile: TileId,
    min_valid_fraction: f64,
    cut_threshold: f32,
    tree_lower_bound: f32,
    overridden: bool,
}

/// Execute the params command.
///
/// # Errors
///
/// Returns an error if a value is outside [0, 1] or the ledger fails.
pub fn execute(args: ParamsArgs, components: &Components, format: OutputFormat) -> Result<()> {
    let ledger = components.ledger.as_ref();
    let tile = match args.action {
        ParamsAction::Show { tile } => tile,
        ParamsAction::Set {
            tile,
            min_valid_fraction,
            cut_threshold,
            tree_lower_bound,
        } => {
            for (name, value) in [
                ("min-valid-fraction", min_valid_fraction),
                ("cut-threshold", cut_threshold.map(f64::from)),
                ("tree-lower-bound", tree_lower_bound.map(f64::from)),
            ] {
                if let Some(value) = value.filter(|v| !(0.0..=1.0).contains(v)) {
                    anyhow::bail!("--{} {} is outside [0, 1]", name, value);
                }
            }
            if let Some(fraction) = min_valid_fraction {
                ledger.set_min_valid_fraction(&tile, fraction)?;
            }
            if cut_threshold.is_some() || tree_lower_bound.is_some() {
                let current = current_change(components, &tile)?;
                ledger.set_change_params(
                    &tile,
                    ChangeParams {
                        cut_threshold: cut_threshold.unwrap_or(current.cut_threshold),
                        tree_lower_bound: tree_lower_bound.unwrap_or(current.tree_lower_bound),
                    },
                )?;
            }
            tracing::info!(tile = %tile, "updated tile overrides");
            tile
        }
        ParamsAction::Clear { tile } => {
            ledger.clear_params(&tile)?;
            tracing::info!(tile = %tile, "cleared tile overrides");
            tile
        }
    };

    let fraction_override = ledger.min_valid_fraction(&tile)?;
    let change_override = ledger.change_params(&tile)?;
    let change = current_change(components, &tile)?;
    let effective = Effective {
        min_valid_fraction: fraction_override.unwrap_or(components.settings.ingest.min_valid_fraction),
        cut_threshold: change.cut_threshold,
        tree_lower_bound: change.tree_lower_bound,
        overridden: fraction_override.is_some() || change_override.is_some(),
        tile,
    };

    match format {
        OutputFormat::Json => print_json(&effective)?,
        OutputFormat::Text => {
            let marker = if effective.overridden { " (overridden)" } else { "" };
            println!("{}{}", effective.tile, marker);
            println!("  min_valid_fraction: {}", effective.min_valid_fraction);
            println!("  cut_threshold:      {}", effective.cut_threshold);
            println!("  tree_lower_bound:   {}", effective.tree_lower_bound);
        }
    }
    Ok(())
}

/// Change thresholds in effect for a tile: its override, else the settings.
fn current_change(components: &Components, tile: &TileId) -> Result<ChangeParams> {
    let processing = &components.settings.processing;
    Ok(components.ledger.change_params(tile)?.unwrap_or(ChangeParams {
        cut_threshold: processing.cut_threshold,
        tree_lower_bound: processing.tree_lower_bound,
    }))
}
