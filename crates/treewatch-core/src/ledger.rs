//! Invalid-image ledger.
//!
//! Durable record of (tile, interval) pairs whose raw image failed quality
//! validation. A record blocks re-ingestion until it is cleared by an explicit
//! retry. The same database holds the per-tile overrides of [`crate::params`].

use crate::error::LedgerError;
use crate::params::PARAMS_SCHEMA;
use crate::registry::IntervalId;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use treewatch_raster::TileId;

/// Busy timeout for the ledger connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A rejected image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidImageRecord {
    /// Tile identifier.
    pub tile: TileId,
    /// Interval identifier.
    pub interval: IntervalId,
    /// Why the image was rejected.
    pub reason: String,
    /// Fraction of pixels with an accepted quality flag.
    pub valid_pixel_fraction: f64,
    /// When the rejection was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Record store for rejected images.
pub trait InvalidImageLedger: Send + Sync {
    /// The record for (tile, interval), if any.
    fn lookup(&self, tile: &TileId, interval: IntervalId) -> Result<Option<InvalidImageRecord>, LedgerError>;

    /// Insert or replace the record for (tile, interval).
    fn record(&self, tile: &TileId, interval: IntervalId, reason: &str, valid_pixel_fraction: f64) -> Result<(), LedgerError>;

    /// Remove the record for (tile, interval). Returns whether one existed.
    fn clear(&self, tile: &TileId, interval: IntervalId) -> Result<bool, LedgerError>;

    /// All records of a tile, by interval.
    fn list(&self, tile: &TileId) -> Result<Vec<InvalidImageRecord>, LedgerError>;
}

/// SQLite-backed ledger and tile parameter store.
pub struct SqliteLedger {
    connection: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger").finish_non_exhaustive()
    }
}

impl SqliteLedger {
    /// Open (creating if needed) the ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let connection = Connection::open_with_flags(path, flags)?;
        connection.execute_batch("PRAGMA journal_mode = WAL;")?;
        connection.busy_timeout(BUSY_TIMEOUT)?;
        Self::init(connection)
    }

    /// In-memory ledger, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(connection: Connection) -> Result<Self, LedgerError> {
        connection.execute_batch(
            "CREATE TABLE IF NOT EXISTS invalid_images (
                tile_id TEXT NOT NULL,
                interval_id INTEGER NOT NULL,
                reason TEXT NOT NULL,
                valid_pixel_fraction REAL NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (tile_id, interval_id)
            );",
        )?;
        connection.execute_batch(PARAMS_SCHEMA)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    pub(crate) fn connection(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock()
    }
}

fn decode_row(tile: &TileId, interval: IntervalId, reason: String, fraction: f64, recorded_at: String) -> Result<InvalidImageRecord, LedgerError> {
    let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
        .map_err(|e| LedgerError::Corrupt {
            tile: tile.to_string(),
            interval,
            reason: format!("recorded_at '{}': {}", recorded_at, e),
        })?
        .with_timezone(&Utc);
    Ok(InvalidImageRecord {
        tile: tile.clone(),
        interval,
        reason,
        valid_pixel_fraction: fraction,
        recorded_at,
    })
}

impl InvalidImageLedger for SqliteLedger {
    fn lookup(&self, tile: &TileId, interval: IntervalId) -> Result<Option<InvalidImageRecord>, LedgerError> {
        let row = self
            .connection()
            .query_row(
                "SELECT reason, valid_pixel_fraction, recorded_at FROM invalid_images
                 WHERE tile_id = ?1 AND interval_id = ?2",
                params![tile.as_str(), interval],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?, row.get::<_, String>(2)?)),
            )
            .optional()?;
        row.map(|(reason, fraction, recorded_at)| decode_row(tile, interval, reason, fraction, recorded_at))
            .transpose()
    }

    fn record(&self, tile: &TileId, interval: IntervalId, reason: &str, valid_pixel_fraction: f64) -> Result<(), LedgerError> {
        self.connection().execute(
            "INSERT INTO invalid_images (tile_id, interval_id, reason, valid_pixel_fraction, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (tile_id, interval_id) DO UPDATE SET
                reason = excluded.reason,
                valid_pixel_fraction = excluded.valid_pixel_fraction,
                recorded_at = excluded.recorded_at",
            params![tile.as_str(), interval, reason, valid_pixel_fraction, Utc::now().to_rfc3339()],
        )?;
        tracing::debug!(%tile, interval, reason, valid_pixel_fraction, "recorded invalid image");
        Ok(())
    }

    fn clear(&self, tile: &TileId, interval: IntervalId) -> Result<bool, LedgerError> {
        let removed = self.connection().execute(
            "DELETE FROM invalid_images WHERE tile_id = ?1 AND interval_id = ?2",
            params![tile.as_str(), interval],
        )?;
        Ok(removed > 0)
    }

    fn list(&self, tile: &TileId) -> Result<Vec<InvalidImageRecord>, LedgerError> {
        let connection = self.connection();
        let mut statement = connection.prepare(
            "SELECT interval_id, reason, valid_pixel_fraction, recorded_at FROM invalid_images
             WHERE tile_id = ?1 ORDER BY interval_id",
        )?;
        let rows = statement.query_map(params![tile.as_str()], |row| {
            Ok((
                row.get::<_, IntervalId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (interval, reason, fraction, recorded_at) = row?;
            records.push(decode_row(tile, interval, reason, fraction, recorded_at)?);
        }
        Ok(records)
    }
}
