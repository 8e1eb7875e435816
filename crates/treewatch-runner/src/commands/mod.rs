//! Subcommand implementations.

pub mod catalog;
pub mod delete;
pub mod ingest;
pub mod intervals;
pub mod params;
pub mod process;
