//! treewatch - GLAD ARD ingestion and tree-loss processing.
//!
//! The main entry point for the `treewatch` binary.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use treewatch_runner::context::Components;
use treewatch_runner::{commands, Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_filter())),
        )
        .init();
    treewatch_metrics::describe_metrics();

    let components = Components::open(cli.settings()?)?;
    let format = cli.format;

    match cli.command {
        Commands::Ingest(args) => commands::ingest::execute(args, &components, format),
        Commands::Process(args) => commands::process::execute(args, &components, format),
        Commands::Delete(args) => commands::delete::execute(args, &components, format),
        Commands::Catalog(args) => commands::catalog::execute(args, &components, format),
        Commands::Intervals(args) => commands::intervals::execute(args, &components, format),
        Commands::Params(args) => commands::params::execute(args, &components, format),
    }
}
