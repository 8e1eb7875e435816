//! Intervals command - inspect the interval registry.

use anyhow::Result;
use chrono::NaiveDate;
use clap::Args;
use treewatch_core::IntervalRecord;

use crate::context::Components;
use crate::{print_json, OutputFormat};

/// Arguments for the intervals command.
#[derive(Debug, Args)]
pub struct IntervalsArgs {
    /// Only intervals old enough to be ingested.
    #[arg(long)]
    pub eligible: bool,

    /// Show the interval covering this date instead of listing (YYYY-MM-DD).
    #[arg(long, conflicts_with = "eligible")]
    pub date: Option<NaiveDate>,
}

/// Execute the intervals command.
///
/// # Errors
///
/// Returns an error if the registry cannot be loaded, or if `--date` falls
/// outside the table.
pub fn execute(args: IntervalsArgs, components: &Components, format: OutputFormat) -> Result<()> {
    let today = chrono::Utc::now().date_naive();
    let registry = components.registry(today)?;
    let table = registry.table();

    let records: Vec<IntervalRecord> = if let Some(date) = args.date {
        let Some(id) = registry.interval_for_date(date) else {
            anyhow::bail!("no interval covers {}", date);
        };
        table.records().iter().filter(|r| r.id == id).copied().collect()
    } else if args.eligible {
        let eligible = registry.eligible_intervals(components.settings.registry.lag_days, today);
        table
            .records()
            .iter()
            .filter(|r| eligible.binary_search(&r.id).is_ok())
            .copied()
            .collect()
    } else {
        table.records().to_vec()
    };

    match format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Text => {
            for record in &records {
                println!("{:>5}  {}", record.id, record.end_date);
            }
            println!("{} intervals", records.len());
        }
    }
    Ok(())
}
