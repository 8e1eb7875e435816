//! Error types for the pipeline.

use std::path::PathBuf;
use thiserror::Error;
use treewatch_raster::RasterError;

/// Configuration could not be loaded or is out of range. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for [`crate::Settings`].
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value is outside its allowed range.
    #[error("Invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// The interval table could not be loaded.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// I/O error reading a table or cache file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error fetching a remote table.
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// The table is not valid JSON.
    #[error("Malformed interval table: {0}")]
    Parse(#[from] serde_json::Error),

    /// The table parsed but is unusable.
    #[error("Invalid interval table: {0}")]
    Invalid(String),

    /// Neither the remote source nor a cached copy is available.
    #[error("Interval table unavailable from {source_name}: {reason}")]
    Unavailable {
        /// Description of the configured source.
        source_name: String,
        /// Why the load failed.
        reason: String,
    },
}

/// Artifact store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error on the backing storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested artifact does not exist.
    #[error("Artifact not found: {0}")]
    NotFound(String),

    /// A URL was requested but no signing key is configured.
    #[error("No signing key configured for artifact URLs")]
    MissingSigningKey,
}

/// Invalid-image ledger failure.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O error preparing the database location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored timestamp could not be parsed.
    #[error("Corrupt ledger row for {tile}/{interval}: {reason}")]
    Corrupt {
        /// Tile identifier.
        tile: String,
        /// Interval identifier.
        interval: u32,
        /// What could not be decoded.
        reason: String,
    },
}

/// Top-level error type for the pipeline.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Interval registry error.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Artifact store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Ledger error.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Raster decoding, encoding or download error.
    #[error("Raster error: {0}")]
    Raster(#[from] RasterError),

    /// I/O error on local staging files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Temporal processing failed.
    #[error("Processing failed for {tile}: {reason}")]
    Processing {
        /// Tile identifier.
        tile: String,
        /// Reason for failure.
        reason: String,
    },
}

impl CoreError {
    /// Whether this error should abort the whole run rather than one interval.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Config(_) | CoreError::Registry(_))
    }
}
