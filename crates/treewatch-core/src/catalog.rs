//! Cached catalog of published products.
//!
//! A [`CatalogSnapshot`] maps each tile to its intervals, their dates and the
//! URLs of the derived products. Snapshots are rebuilt wholesale from the
//! artifact store and the interval registry and swapped in atomically; readers
//! holding the previous snapshot keep it until they drop it.

use crate::error::CoreError;
use crate::registry::{IntervalId, IntervalRegistry};
use crate::store::{ArtifactKey, ArtifactStore, ProductLevel};
use chrono::{DateTime, NaiveDate, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use treewatch_metrics::metric_defs;
use treewatch_raster::{TileBounds, TileId};

/// One interval of a tile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    /// Interval identifier.
    pub interval_id: IntervalId,
    /// Cutoff date of the interval.
    pub date: NaiveDate,
    /// URL of the RGBA composite, if published.
    pub composite_url: Option<String>,
    /// URL of the change band, if published.
    pub change_url: Option<String>,
}

/// Description of a served product layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerInfo {
    /// Display name.
    pub name: String,
    /// Product level.
    pub level: ProductLevel,
    /// Number of bands.
    pub bands: usize,
}

/// Layers listed in every snapshot, topmost first.
pub fn default_layers() -> Vec<LayerInfo> {
    vec![
        LayerInfo {
            name: "Tree Cover".to_string(),
            level: ProductLevel::Change,
            bands: 1,
        },
        LayerInfo {
            name: "True Color Image".to_string(),
            level: ProductLevel::Composite,
            bands: 4,
        },
    ]
}

/// An immutable view of the catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogSnapshot {
    /// When the snapshot was built.
    pub built_at: DateTime<Utc>,
    /// Public base URL of the artifacts.
    pub base_url: String,
    /// Product layers.
    pub layers: Vec<LayerInfo>,
    /// Intervals per tile, ascending by date.
    pub tiles: BTreeMap<TileId, Vec<CatalogEntry>>,
    /// Geographic bounds of every listed tile.
    pub bounds: BTreeMap<TileId, TileBounds>,
    /// Attribution strings.
    pub attributions: Vec<String>,
}

impl CatalogSnapshot {
    /// A snapshot with no tiles.
    pub fn empty(base_url: impl Into<String>, attributions: Vec<String>) -> Self {
        Self {
            built_at: Utc::now(),
            base_url: base_url.into(),
            layers: default_layers(),
            tiles: BTreeMap::new(),
            bounds: BTreeMap::new(),
            attributions,
        }
    }

    /// Number of tiles.
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Keep, per tile, only the most recent interval dated strictly before
    /// `cutoff`. Tiles without one are omitted.
    pub fn select(&self, cutoff: NaiveDate) -> CatalogSnapshot {
        let tiles: BTreeMap<TileId, Vec<CatalogEntry>> = self
            .tiles
            .iter()
            .filter_map(|(tile, entries)| {
                entries
                    .iter()
                    .filter(|entry| entry.date < cutoff)
                    .max_by_key(|entry| (entry.date, entry.interval_id))
                    .map(|entry| (tile.clone(), vec![entry.clone()]))
            })
            .collect();
        let bounds = self
            .bounds
            .iter()
            .filter(|(tile, _)| tiles.contains_key(*tile))
            .map(|(tile, bounds)| (tile.clone(), *bounds))
            .collect();

        CatalogSnapshot {
            built_at: self.built_at,
            base_url: self.base_url.clone(),
            layers: self.layers.clone(),
            tiles,
            bounds,
            attributions: self.attributions.clone(),
        }
    }

    /// Pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Serving cache of catalog snapshots.
pub struct Catalog {
    store: Arc<dyn ArtifactStore>,
    registry: Arc<IntervalRegistry>,
    base_url: String,
    url_ttl: Duration,
    attributions: Vec<String>,
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("base_url", &self.base_url)
            .field("url_ttl", &self.url_ttl)
            .field("tiles", &self.current.read().tile_count())
            .finish_non_exhaustive()
    }
}

impl Catalog {
    /// Create a catalog serving an empty snapshot until the first rebuild.
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        registry: Arc<IntervalRegistry>,
        base_url: impl Into<String>,
        url_ttl: Duration,
        attributions: Vec<String>,
    ) -> Self {
        let base_url = base_url.into();
        let empty = CatalogSnapshot::empty(base_url.clone(), attributions.clone());
        Self {
            store,
            registry,
            base_url,
            url_ttl,
            attributions,
            current: RwLock::new(Arc::new(empty)),
        }
    }

    /// The snapshot currently served.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Filter the current snapshot to the most recent interval before `cutoff`.
    pub fn select(&self, cutoff: NaiveDate) -> CatalogSnapshot {
        self.snapshot().select(cutoff)
    }

    /// List the store and registry and replace the served snapshot.
    ///
    /// On failure the previous snapshot stays in place.
    pub fn rebuild(&self) -> Result<Arc<CatalogSnapshot>, CoreError> {
        let started = Instant::now();
        let snapshot = match self.build() {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                metrics::counter!(metric_defs::CATALOG_REBUILD_FAILURES.name).increment(1);
                return Err(e);
            }
        };

        *self.current.write() = Arc::clone(&snapshot);

        let elapsed = started.elapsed();
        metrics::gauge!(metric_defs::CATALOG_TILES.name).set(snapshot.tile_count() as f64);
        metrics::histogram!(metric_defs::CATALOG_REBUILD_TIME.name).record(elapsed.as_secs_f64() * 1000.0);
        tracing::info!(tiles = snapshot.tile_count(), elapsed_ms = elapsed.as_millis() as u64, "catalog rebuilt");
        Ok(snapshot)
    }

    fn build(&self) -> Result<CatalogSnapshot, CoreError> {
        let table = self.registry.table();
        let mut tiles = BTreeMap::new();
        let mut bounds = BTreeMap::new();

        for tile in self.store.list_tiles()? {
            let mut entries = Vec::new();
            for interval in self.store.list_intervals(&tile)? {
                let Some(date) = table.date_of(interval) else {
                    tracing::debug!(%tile, interval, "interval not in registry, skipped");
                    continue;
                };
                let levels = self.store.list_levels(&tile, interval)?;
                let url = |level: ProductLevel| -> Result<Option<String>, CoreError> {
                    if levels.contains(&level) {
                        let key = ArtifactKey::new(tile.clone(), interval, level);
                        Ok(Some(self.store.get_url(&key, self.url_ttl)?))
                    } else {
                        Ok(None)
                    }
                };
                let composite_url = url(ProductLevel::Composite)?;
                let change_url = url(ProductLevel::Change)?;
                if composite_url.is_none() && change_url.is_none() {
                    continue;
                }
                entries.push(CatalogEntry {
                    interval_id: interval,
                    date,
                    composite_url,
                    change_url,
                });
            }
            if !entries.is_empty() {
                entries.sort_by_key(|entry| (entry.date, entry.interval_id));
                bounds.insert(tile.clone(), tile.bounds());
                tiles.insert(tile, entries);
            }
        }

        Ok(CatalogSnapshot {
            built_at: Utc::now(),
            base_url: self.base_url.clone(),
            layers: default_layers(),
            tiles,
            bounds,
            attributions: self.attributions.clone(),
        })
    }
}

/// Background thread rebuilding a catalog on a fixed cadence.
pub struct CatalogRefresher {
    stop_tx: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
    interval: Duration,
}

impl CatalogRefresher {
    /// Start refreshing `catalog` every `interval`. The first rebuild runs
    /// immediately.
    pub fn start(catalog: Arc<Catalog>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let thread_handle = thread::spawn(move || refresh_loop(&catalog, interval, &stop_rx));
        Self {
            stop_tx: Some(stop_tx),
            thread_handle: Some(thread_handle),
            interval,
        }
    }

    /// Rebuild cadence.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stop the thread and wait for it to finish.
    pub fn stop(mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CatalogRefresher {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the thread; it exits on its own
        self.stop_tx.take();
    }
}

fn refresh_loop(catalog: &Catalog, interval: Duration, stop_rx: &Receiver<()>) {
    loop {
        if let Err(e) = catalog.rebuild() {
            tracing::warn!(error = %e, "catalog rebuild failed, keeping previous snapshot");
        }
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("catalog refresher stopped");
}
