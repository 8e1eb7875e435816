//! # treewatch-core
//!
//! Ingestion, temporal processing and cataloguing of GLAD ARD 16-day imagery.
//!
//! ## Components
//!
//! - [`IntervalRegistry`]: maps calendar dates to 16-day interval ids and
//!   decides which intervals are old enough to be published.
//! - [`ArtifactStore`]: published rasters keyed by (tile, interval, level),
//!   with signed time-limited URLs. [`FsArtifactStore`] keeps them on disk.
//! - [`InvalidImageLedger`]: images rejected by quality validation.
//!   [`SqliteLedger`] also stores per-tile overrides ([`TileParamStore`]).
//! - [`IngestPipeline`]: download, validate, normalize and publish raw imagery.
//! - [`TemporalProcessor`]: derive RGBA composites and the tree-loss change
//!   band from a tile's full time series, block by block.
//! - [`Catalog`]: cached listing of published products for serving.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use treewatch_core::{
//!     FsArtifactStore, IngestPipeline, IngestPolicy, IntervalRegistry, IntervalTable, SqliteLedger,
//! };
//! use treewatch_raster::{HttpSourceFetcher, TileId, DEFAULT_SOURCE_URL, DEFAULT_TIMEOUT};
//!
//! let registry = IntervalRegistry::from_table(IntervalTable::glad_16_day(2020, 2024));
//! let store = Arc::new(FsArtifactStore::new("data/artifacts", "http://localhost:8080/tiles", None)?);
//! let ledger = Arc::new(SqliteLedger::open("data/ledger.sqlite".as_ref())?);
//! let fetcher = Arc::new(HttpSourceFetcher::new(DEFAULT_SOURCE_URL, None, DEFAULT_TIMEOUT)?);
//!
//! let pipeline = IngestPipeline::new(fetcher, store, ledger, IngestPolicy::default(), "/tmp/treewatch");
//! let tile = TileId::parse("105W_40N")?;
//! let today = chrono::Utc::now().date_naive();
//! let report = pipeline.ingest_tile(&tile, &registry.eligible_intervals(20, today), false);
//! for (interval, outcome) in &report.outcomes {
//!     println!("{}: {}", interval, outcome);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod params;
pub mod registry;
mod staging;
pub mod store;
pub mod temporal;

pub use catalog::{Catalog, CatalogEntry, CatalogRefresher, CatalogSnapshot, LayerInfo};
pub use config::Settings;
pub use error::{ConfigError, CoreError, LedgerError, RegistryError, StoreError};
pub use ingest::{IngestOutcome, IngestPipeline, IngestPolicy, TileReport};
pub use ledger::{InvalidImageLedger, InvalidImageRecord, SqliteLedger};
pub use params::{ChangeParams, TileParamStore};
pub use registry::{IntervalId, IntervalRecord, IntervalRegistry, IntervalTable, TableSource};
pub use store::{sign_path, verify_url_signature, ArtifactKey, ArtifactStore, FsArtifactStore, ProductLevel};
pub use temporal::change::ChangeConfig;
pub use temporal::{ProcessReport, ProcessorConfig, TemporalProcessor};

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, CoreError>;
