//! Metric declarations for the treewatch pipeline.
//!
//! Every metric the pipeline emits is declared once in [`metric_defs`] as a
//! [`Metric`] constant; call sites refer to `metric_defs::X.name` instead of
//! repeating string literals. Tile-scoped metrics share [`TileLabels`].
//!
//! ```rust
//! use treewatch_metrics::{describe_metrics, metric_defs, TileLabels};
//!
//! describe_metrics();
//!
//! let labels = TileLabels::new("105W_40N").with_level("composite");
//! metrics::counter!(metric_defs::ARTIFACTS_PUBLISHED.name, &labels.to_labels()).increment(1);
//! ```
//!
//! Declarations are `const`:
//!
//! ```rust
//! use treewatch_metrics::{Metric, MetricKind};
//! use metrics::Unit;
//!
//! const TILES_SCANNED: Metric = Metric::counter("treewatch.example.tiles_scanned")
//!     .with_description("Tiles visited by a scan")
//!     .with_unit(Unit::Count)
//!     .with_labels(&["tile"]);
//!
//! assert_eq!(TILES_SCANNED.kind, MetricKind::Counter);
//! assert_eq!(TILES_SCANNED.kind.to_string(), "counter");
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// Counter, gauge or histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Only ever incremented.
    Counter,
    /// Set to the latest value.
    Gauge,
    /// Distribution of recorded samples.
    Histogram,
}

impl MetricKind {
    /// Lowercase name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name, kind and metadata of one metric.
#[derive(Debug, Clone)]
pub struct Metric {
    /// Dotted name, e.g. `treewatch.ingest.outcomes`.
    pub name: &'static str,
    /// Kind.
    pub kind: MetricKind,
    /// Description reported to the recorder. Empty when unset.
    pub description: &'static str,
    /// Unit, if any.
    pub unit: Option<Unit>,
    /// Label keys attached at the call sites.
    pub labels: &'static [&'static str],
}

impl Metric {
    const fn new(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Declare a counter.
    pub const fn counter(name: &'static str) -> Self {
        Self::new(name, MetricKind::Counter)
    }

    /// Declare a gauge.
    pub const fn gauge(name: &'static str) -> Self {
        Self::new(name, MetricKind::Gauge)
    }

    /// Declare a histogram.
    pub const fn histogram(name: &'static str) -> Self {
        Self::new(name, MetricKind::Histogram)
    }

    /// Attach a description.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Attach a unit.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Attach the label keys.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Report the description and unit to the installed recorder.
    pub fn describe(&self) {
        let (name, text) = (self.name, self.description);
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => describe_counter!(name, unit, text),
            (MetricKind::Counter, None) => describe_counter!(name, text),
            (MetricKind::Gauge, Some(unit)) => describe_gauge!(name, unit, text),
            (MetricKind::Gauge, None) => describe_gauge!(name, text),
            (MetricKind::Histogram, Some(unit)) => describe_histogram!(name, unit, text),
            (MetricKind::Histogram, None) => describe_histogram!(name, text),
        }
    }
}

/// All metric definitions for the pipeline.
pub mod metric_defs {
    use super::{Metric, Unit};

    // ========================================================================
    // Standard Label Keys
    // ========================================================================

    /// Labels present on all tile-scoped metrics.
    pub const TILE_LABELS: &[&str] = &["tile"];

    // ========================================================================
    // Registry
    // ========================================================================

    /// Interval table loads.
    ///
    /// Labels: origin (file, remote, cache, generated)
    pub const REGISTRY_LOADS: Metric = Metric::counter("treewatch.registry.loads")
        .with_description("Interval table loads by origin")
        .with_unit(Unit::Count)
        .with_labels(&["origin"]);

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Per-interval ingest outcomes.
    ///
    /// Labels: tile, outcome (stored, already_present, skipped_invalid, rejected, transient_error)
    pub const INGEST_OUTCOMES: Metric = Metric::counter("treewatch.ingest.outcomes")
        .with_description("Per-interval ingest outcomes")
        .with_unit(Unit::Count)
        .with_labels(&["tile", "outcome"]);

    /// Bytes of raw imagery downloaded.
    ///
    /// Labels: tile
    pub const INGEST_BYTES_DOWNLOADED: Metric = Metric::counter("treewatch.ingest.bytes_downloaded")
        .with_description("Bytes of raw imagery downloaded from the source archive")
        .with_unit(Unit::Bytes)
        .with_labels(TILE_LABELS);

    /// Valid pixel fraction of each validated image.
    ///
    /// Labels: tile
    pub const INGEST_VALID_FRACTION: Metric = Metric::histogram("treewatch.ingest.valid_fraction")
        .with_description("Fraction of pixels with an accepted quality flag")
        .with_unit(Unit::Percent)
        .with_labels(TILE_LABELS);

    /// Downloads that waited on an identical in-flight request.
    ///
    /// Labels: tile
    pub const INGEST_COALESCED: Metric = Metric::counter("treewatch.ingest.coalesced")
        .with_description("Ingest requests that joined an in-flight request for the same image")
        .with_unit(Unit::Count)
        .with_labels(TILE_LABELS);

    // ========================================================================
    // Artifacts
    // ========================================================================

    /// Artifacts published to the store.
    ///
    /// Labels: tile, level (raw, composite, change)
    pub const ARTIFACTS_PUBLISHED: Metric = Metric::counter("treewatch.artifacts.published")
        .with_description("Artifacts published to the store")
        .with_unit(Unit::Count)
        .with_labels(&["tile", "level"]);

    /// Artifacts deleted from the store.
    ///
    /// Labels: tile
    pub const ARTIFACTS_DELETED: Metric = Metric::counter("treewatch.artifacts.deleted")
        .with_description("Artifacts deleted from the store")
        .with_unit(Unit::Count)
        .with_labels(TILE_LABELS);

    // ========================================================================
    // Temporal Processing
    // ========================================================================

    /// Wall time to transform one block of the stack.
    ///
    /// Labels: level
    pub const PROCESS_BLOCK_TIME: Metric = Metric::histogram("treewatch.process.block_time_us")
        .with_description("Time to transform one block of the temporal stack")
        .with_unit(Unit::Microseconds)
        .with_labels(&["level"]);

    /// Intervals in each processed stack.
    ///
    /// Labels: tile, level
    pub const PROCESS_STACK_DEPTH: Metric = Metric::histogram("treewatch.process.stack_depth")
        .with_description("Number of intervals in a processed stack")
        .with_unit(Unit::Count)
        .with_labels(&["tile", "level"]);

    // ========================================================================
    // Catalog
    // ========================================================================

    /// Tiles in the served catalog snapshot.
    pub const CATALOG_TILES: Metric = Metric::gauge("treewatch.catalog.tiles")
        .with_description("Tiles in the served catalog snapshot")
        .with_unit(Unit::Count);

    /// Time to rebuild the catalog snapshot.
    pub const CATALOG_REBUILD_TIME: Metric = Metric::histogram("treewatch.catalog.rebuild_time_ms")
        .with_description("Time to rebuild the catalog snapshot")
        .with_unit(Unit::Milliseconds);

    /// Failed catalog rebuilds (previous snapshot kept).
    pub const CATALOG_REBUILD_FAILURES: Metric = Metric::counter("treewatch.catalog.rebuild_failures")
        .with_description("Catalog rebuilds that failed and kept the previous snapshot")
        .with_unit(Unit::Count);

    /// Returns a slice of all defined metrics.
    pub const ALL: &[&Metric] = &[
        &REGISTRY_LOADS,
        &INGEST_OUTCOMES,
        &INGEST_BYTES_DOWNLOADED,
        &INGEST_VALID_FRACTION,
        &INGEST_COALESCED,
        &ARTIFACTS_PUBLISHED,
        &ARTIFACTS_DELETED,
        &PROCESS_BLOCK_TIME,
        &PROCESS_STACK_DEPTH,
        &CATALOG_TILES,
        &CATALOG_REBUILD_TIME,
        &CATALOG_REBUILD_FAILURES,
    ];
}

/// Labels identifying the tile (and optionally the product level) a metric refers to.
///
/// # Example
///
/// ```rust
/// use treewatch_metrics::TileLabels;
///
/// let labels = TileLabels::new("105W_40N").with_level("change");
/// assert_eq!(labels.to_labels().len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct TileLabels {
    /// Tile identifier.
    pub tile: String,
    /// Product level, if the metric is level-scoped.
    pub level: Option<String>,
}

impl TileLabels {
    /// Creates labels for a tile.
    pub fn new(tile: impl Into<String>) -> Self {
        Self {
            tile: tile.into(),
            level: None,
        }
    }

    /// Adds the product level.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = Some(level.into());
        self
    }

    /// Label pairs in the form the `metrics` macros take.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        let mut labels = vec![("tile", self.tile.clone())];
        if let Some(level) = &self.level {
            labels.push(("level", level.clone()));
        }
        labels
    }

    /// Label pairs followed by `extra`.
    pub fn with(&self, extra: &[(&'static str, String)]) -> Vec<(&'static str, String)> {
        self.to_labels().into_iter().chain(extra.iter().cloned()).collect()
    }
}

/// Describes all metrics used by the pipeline.
///
/// Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}
