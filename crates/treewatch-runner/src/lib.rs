//! # treewatch-runner
//!
//! Batch entry points for the treewatch pipeline.
//!
//! ## Commands
//!
//! - `treewatch ingest <tile>` - download, validate and store raw imagery
//! - `treewatch process <tile> <composite|change>` - derive products from the stored series
//! - `treewatch delete <tile>` - remove every artifact of a tile
//! - `treewatch catalog` - rebuild and print the tile catalog
//! - `treewatch intervals` - inspect the interval registry
//! - `treewatch params` - per-tile threshold overrides
//!
//! Every batch command prints one line per interval; a failure on one
//! interval never stops the others.
//!
//! ## Configuration
//!
//! Settings come from the YAML file named by `--config` or
//! `TREEWATCH_CONFIG`; without one the defaults are used. Secrets may be
//! supplied through `TREEWATCH_SOURCE_PASSWORD` and `TREEWATCH_SIGNING_KEY`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod commands;
pub mod context;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use treewatch_core::Settings;

/// GLAD ARD ingestion and tree-loss processing.
#[derive(Debug, Parser)]
#[command(name = "treewatch")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Settings file.
    #[arg(long, short = 'c', env = "TREEWATCH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Load settings from `--config`, or defaults plus environment secrets.
    pub fn settings(&self) -> Result<Settings> {
        match &self.config {
            Some(path) => {
                Settings::load(path).with_context(|| format!("failed to load settings from {}", path.display()))
            }
            None => {
                let mut settings = Settings::default();
                settings.apply_env();
                settings.validate()?;
                Ok(settings)
            }
        }
    }

    /// Default log filter for the chosen verbosity.
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Ingest every eligible interval of a tile.
    Ingest(commands::ingest::IngestArgs),
    /// Derive composite or change products for a tile.
    Process(commands::process::ProcessArgs),
    /// Delete all artifacts of a tile.
    Delete(commands::delete::DeleteArgs),
    /// Rebuild and print the catalog.
    Catalog(commands::catalog::CatalogArgs),
    /// List registry intervals.
    Intervals(commands::intervals::IntervalsArgs),
    /// Show or change per-tile overrides.
    Params(commands::params::ParamsArgs),
}

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// One line per outcome.
    #[default]
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Print a value as pretty JSON.
pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use treewatch_core::ProductLevel;

    #[test]
    fn test_ingest_flags() {
        let cli = Cli::parse_from(["treewatch", "--format", "json", "ingest", "105W_40N", "--retry"]);
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::Ingest(args) => {
                assert_eq!(args.tile.as_str(), "105W_40N");
                assert!(args.retry);
                assert!(args.interval.is_empty());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_process_level_aliases() {
        for (name, level) in [
            ("composite", ProductLevel::Composite),
            ("rgba", ProductLevel::Composite),
            ("change", ProductLevel::Change),
            ("treecover", ProductLevel::Change),
        ] {
            let cli = Cli::parse_from(["treewatch", "process", "012E_05S", name]);
            match cli.command {
                Commands::Process(args) => assert_eq!(args.level, level),
                other => panic!("unexpected command {:?}", other),
            }
        }
    }

    #[test]
    fn test_rejects_malformed_tile() {
        assert!(Cli::try_parse_from(["treewatch", "delete", "north"]).is_err());
    }

    #[test]
    fn test_verbose_raises_filter() {
        let cli = Cli::parse_from(["treewatch", "intervals", "-v"]);
        assert_eq!(cli.log_filter(), "debug");
        let cli = Cli::parse_from(["treewatch", "intervals"]);
        assert_eq!(cli.log_filter(), "info");
    }
}
