//! Catalog command - rebuild the catalog and print it.

use anyhow::{Context as _, Result};
use chrono::NaiveDate;
use clap::Args;
use std::sync::Arc;

use crate::context::Components;
use crate::{print_json, OutputFormat};

/// Arguments for the catalog command.
#[derive(Debug, Args)]
pub struct CatalogArgs {
    /// Keep only the latest interval strictly before this date (YYYY-MM-DD).
    #[arg(long)]
    pub date: Option<NaiveDate>,
}

/// Execute the catalog command.
///
/// # Errors
///
/// Returns an error if the registry cannot be loaded or the rebuild fails.
pub fn execute(args: CatalogArgs, components: &Components, format: OutputFormat) -> Result<()> {
    let registry = Arc::new(components.registry(chrono::Utc::now().date_naive())?);
    let catalog = components.catalog(registry);
    let snapshot = catalog.rebuild().context("catalog rebuild failed")?;
    let snapshot = match args.date {
        Some(cutoff) => snapshot.select(cutoff),
        None => (*snapshot).clone(),
    };

    match format {
        OutputFormat::Json => print_json(&snapshot)?,
        OutputFormat::Text => {
            for (tile, entries) in &snapshot.tiles {
                for entry in entries {
                    let products: Vec<&str> = [
                        entry.composite_url.as_ref().map(|_| "composite"),
                        entry.change_url.as_ref().map(|_| "change"),
                    ]
                    .into_iter()
                    .flatten()
                    .collect();
                    println!("{} {:>5}  {}  {}", tile, entry.interval_id, entry.date, products.join(","));
                }
            }
            println!("{} tiles", snapshot.tile_count());
        }
    }
    Ok(())
}
