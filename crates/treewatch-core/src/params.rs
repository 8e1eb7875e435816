//! Per-tile policy overrides.
//!
//! Some tiles need a looser quality threshold (persistently cloudy regions)
//! or different change-detection constants (sparse canopy). Overrides are kept
//! next to the invalid-image ledger and fall back to the configured defaults.

use crate::error::LedgerError;
use crate::ledger::SqliteLedger;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use treewatch_raster::TileId;

/// Change-detection constants for one tile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChangeParams {
    /// Drop below the running peak that counts as loss.
    pub cut_threshold: f32,
    /// Floor for the loss trigger.
    pub tree_lower_bound: f32,
}

/// Storage for per-tile overrides.
pub trait TileParamStore: Send + Sync {
    /// Minimum valid fraction override for ingestion.
    fn min_valid_fraction(&self, tile: &TileId) -> Result<Option<f64>, LedgerError>;

    /// Set the ingestion override.
    fn set_min_valid_fraction(&self, tile: &TileId, fraction: f64) -> Result<(), LedgerError>;

    /// Change-detection override.
    fn change_params(&self, tile: &TileId) -> Result<Option<ChangeParams>, LedgerError>;

    /// Set the change-detection override.
    fn set_change_params(&self, tile: &TileId, params: ChangeParams) -> Result<(), LedgerError>;

    /// Remove every override for a tile.
    fn clear_params(&self, tile: &TileId) -> Result<(), LedgerError>;
}

pub(crate) const PARAMS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS ingest_params (
        tile_id TEXT PRIMARY KEY,
        min_valid_fraction REAL NOT NULL
    );
    CREATE TABLE IF NOT EXISTS change_params (
        tile_id TEXT PRIMARY KEY,
        cut_threshold REAL NOT NULL,
        tree_lower_bound REAL NOT NULL
    );";

impl TileParamStore for SqliteLedger {
    fn min_valid_fraction(&self, tile: &TileId) -> Result<Option<f64>, LedgerError> {
        Ok(self
            .connection()
            .query_row(
                "SELECT min_valid_fraction FROM ingest_params WHERE tile_id = ?1",
                params![tile.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_min_valid_fraction(&self, tile: &TileId, fraction: f64) -> Result<(), LedgerError> {
        self.connection().execute(
            "INSERT INTO ingest_params (tile_id, min_valid_fraction) VALUES (?1, ?2)
             ON CONFLICT (tile_id) DO UPDATE SET min_valid_fraction = excluded.min_valid_fraction",
            params![tile.as_str(), fraction],
        )?;
        Ok(())
    }

    fn change_params(&self, tile: &TileId) -> Result<Option<ChangeParams>, LedgerError> {
        Ok(self
            .connection()
            .query_row(
                "SELECT cut_threshold, tree_lower_bound FROM change_params WHERE tile_id = ?1",
                params![tile.as_str()],
                |row| {
                    Ok(ChangeParams {
                        cut_threshold: row.get::<_, f64>(0)? as f32,
                        tree_lower_bound: row.get::<_, f64>(1)? as f32,
                    })
                },
            )
            .optional()?)
    }

    fn set_change_params(&self, tile: &TileId, params: ChangeParams) -> Result<(), LedgerError> {
        self.connection().execute(
            "INSERT INTO change_params (tile_id, cut_threshold, tree_lower_bound) VALUES (?1, ?2, ?3)
             ON CONFLICT (tile_id) DO UPDATE SET
                cut_threshold = excluded.cut_threshold,
                tree_lower_bound = excluded.tree_lower_bound",
            params![tile.as_str(), f64::from(params.cut_threshold), f64::from(params.tree_lower_bound)],
        )?;
        Ok(())
    }

    fn clear_params(&self, tile: &TileId) -> Result<(), LedgerError> {
        let connection = self.connection();
        connection.execute("DELETE FROM ingest_params WHERE tile_id = ?1", params![tile.as_str()])?;
        connection.execute("DELETE FROM change_params WHERE tile_id = ?1", params![tile.as_str()])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let store = SqliteLedger::open_in_memory().unwrap();
        let tile = TileId::parse("105W_40N").unwrap();

        assert_eq!(store.min_valid_fraction(&tile).unwrap(), None);
        assert_eq!(store.change_params(&tile).unwrap(), None);

        store.set_min_valid_fraction(&tile, 0.5).unwrap();
        store.set_min_valid_fraction(&tile, 0.55).unwrap();
        assert_eq!(store.min_valid_fraction(&tile).unwrap(), Some(0.55));

        let params = ChangeParams {
            cut_threshold: 0.25,
            tree_lower_bound: 0.5,
        };
        store.set_change_params(&tile, params).unwrap();
        assert_eq!(store.change_params(&tile).unwrap(), Some(params));

        store.clear_params(&tile).unwrap();
        assert_eq!(store.min_valid_fraction(&tile).unwrap(), None);
        assert_eq!(store.change_params(&tile).unwrap(), None);
    }
}
