//! Ingestion pipeline against an in-process source.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use treewatch_core::{
    ArtifactKey, ArtifactStore, FsArtifactStore, IngestOutcome, IngestPipeline, IngestPolicy, InvalidImageLedger,
    ProductLevel, SqliteLedger, TileParamStore,
};
use treewatch_raster::{write_layout, LayoutOptions, LayoutReader, Raster, RasterError, SourceFetcher, TileId};

const SIDE: u32 = 10;

/// What the fake source serves for an interval.
#[derive(Clone)]
enum Asset {
    /// Eight-band image with this many valid pixels out of 100.
    Image { valid: usize },
    /// Bytes that are not a TIFF.
    Garbage,
    /// Transport failure.
    Unreachable,
}

struct FakeSource {
    assets: Mutex<HashMap<u32, Asset>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeSource {
    fn new() -> Self {
        Self {
            assets: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn serve(&self, interval: u32, asset: Asset) {
        self.assets.lock().insert(interval, asset);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Raw image whose first `valid` pixels carry an accepted quality flag.
fn raw_image(valid: usize) -> Raster<u16> {
    let pixels = (SIDE * SIDE) as usize;
    let mut bands: Vec<Vec<u16>> = (0..7u16)
        .map(|b| (0..pixels).map(|i| 1000 + b * 100 + i as u16).collect())
        .collect();
    bands.push((0..pixels).map(|i| if i < valid { 1 } else { 50 }).collect());
    Raster::from_bands(SIDE, SIDE, bands).unwrap()
}

impl SourceFetcher for FakeSource {
    fn fetch(&self, tile: &TileId, interval: u32, dest: &Path) -> treewatch_raster::Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let asset = self.assets.lock().get(&interval).cloned().unwrap_or(Asset::Unreachable);
        match asset {
            Asset::Image { valid } => {
                let summary = write_layout(dest, &mut raw_image(valid), &LayoutOptions::default())?;
                Ok(summary.bytes)
            }
            Asset::Garbage => {
                std::fs::write(dest, b"definitely not a tiff")?;
                Ok(21)
            }
            Asset::Unreachable => Err(RasterError::DownloadFailed {
                tile: tile.to_string(),
                interval,
                reason: "connection refused".to_string(),
            }),
        }
    }
}

struct Harness {
    dir: tempfile::TempDir,
    source: Arc<FakeSource>,
    store: Arc<FsArtifactStore>,
    ledger: Arc<SqliteLedger>,
    pipeline: IngestPipeline,
}

fn harness(source: FakeSource) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(source);
    let store = Arc::new(FsArtifactStore::new(dir.path().join("store"), "http://tiles", Some("k".to_string())).unwrap());
    let ledger = Arc::new(SqliteLedger::open(&dir.path().join("ledger.sqlite")).unwrap());
    let pipeline = IngestPipeline::new(
        source.clone(),
        store.clone(),
        ledger.clone(),
        IngestPolicy::default(),
        dir.path().join("staging"),
    )
    .with_params(ledger.clone());
    Harness {
        dir,
        source,
        store,
        ledger,
        pipeline,
    }
}

fn tile() -> TileId {
    TileId::parse("105W_40N").unwrap()
}

fn raw_key(interval: u32) -> ArtifactKey {
    ArtifactKey::new(tile(), interval, ProductLevel::Raw)
}

#[test]
fn test_second_ingest_is_idempotent() {
    let h = harness(FakeSource::new());
    h.source.serve(1000, Asset::Image { valid: 100 });

    let first = h.pipeline.ingest(&tile(), 1000, false).unwrap();
    assert!(matches!(first, IngestOutcome::Stored { valid_fraction, .. } if valid_fraction == 1.0));
    let stored = std::fs::read(h.store.path_of(&raw_key(1000))).unwrap();

    let second = h.pipeline.ingest(&tile(), 1000, false).unwrap();
    assert_eq!(second, IngestOutcome::AlreadyPresent);
    assert_eq!(h.source.calls(), 1, "no second download");
    assert_eq!(std::fs::read(h.store.path_of(&raw_key(1000))).unwrap(), stored);
}

#[test]
fn test_threshold_is_inclusive() {
    let h = harness(FakeSource::new());
    h.source.serve(1, Asset::Image { valid: 70 });
    h.source.serve(2, Asset::Image { valid: 69 });

    let at = h.pipeline.ingest(&tile(), 1, false).unwrap();
    assert!(matches!(at, IngestOutcome::Stored { valid_fraction, .. } if valid_fraction == 0.7));

    let below = h.pipeline.ingest(&tile(), 2, false).unwrap();
    assert!(matches!(below, IngestOutcome::Rejected { valid_fraction, .. } if valid_fraction == 0.69));
    assert!(!h.store.exists(&raw_key(2)).unwrap());

    let record = h.ledger.lookup(&tile(), 2).unwrap().expect("rejection recorded");
    assert_eq!(record.valid_pixel_fraction, 0.69);
    assert!(record.reason.contains("below threshold"));
}

#[test]
fn test_invalid_pixels_are_normalized() {
    let h = harness(FakeSource::new());
    h.source.serve(5, Asset::Image { valid: 80 });
    h.pipeline.ingest(&tile(), 5, false).unwrap();

    let mut reader = LayoutReader::<u16>::open(h.store.path_of(&raw_key(5))).unwrap();
    assert_eq!(reader.band_count(), 8);
    assert_eq!(reader.nodata(), Some(0.0));
    for band in 0..8 {
        let values = reader.read_window(band, 0, 0, SIDE, SIDE).unwrap();
        assert!(values[..80].iter().all(|&v| v != 0), "band {} keeps valid pixels", band);
        assert!(values[80..].iter().all(|&v| v == 0), "band {} clears invalid pixels", band);
    }
}

#[test]
fn test_skip_then_retry() {
    let h = harness(FakeSource::new());
    h.source.serve(3, Asset::Image { valid: 10 });
    assert!(matches!(h.pipeline.ingest(&tile(), 3, false).unwrap(), IngestOutcome::Rejected { .. }));

    // Without retry the ledger short-circuits, even once the source improves
    h.source.serve(3, Asset::Image { valid: 95 });
    let skipped = h.pipeline.ingest(&tile(), 3, false).unwrap();
    assert!(matches!(skipped, IngestOutcome::SkippedInvalid { valid_fraction, .. } if valid_fraction == 0.1));
    assert_eq!(h.source.calls(), 1);

    let retried = h.pipeline.ingest(&tile(), 3, true).unwrap();
    assert!(matches!(retried, IngestOutcome::Stored { .. }));
    assert!(h.ledger.lookup(&tile(), 3).unwrap().is_none());
}

#[test]
fn test_undecodable_image_is_rejected() {
    let h = harness(FakeSource::new());
    h.source.serve(4, Asset::Garbage);

    let outcome = h.pipeline.ingest(&tile(), 4, false).unwrap();
    assert!(matches!(outcome, IngestOutcome::Rejected { valid_fraction, .. } if valid_fraction == 0.0));
    assert!(h.ledger.lookup(&tile(), 4).unwrap().is_some());
}

#[test]
fn test_transport_failure_is_not_recorded() {
    let h = harness(FakeSource::new());
    let outcome = h.pipeline.ingest(&tile(), 9, false).unwrap();
    assert!(matches!(outcome, IngestOutcome::TransientError { .. }));
    assert!(h.ledger.lookup(&tile(), 9).unwrap().is_none());

    // Retried on the next run
    h.source.serve(9, Asset::Image { valid: 100 });
    assert!(matches!(h.pipeline.ingest(&tile(), 9, false).unwrap(), IngestOutcome::Stored { .. }));
}

#[test]
fn test_batch_continues_past_failures() {
    let h = harness(FakeSource::new());
    let intervals: Vec<u32> = (1..=20).collect();
    for &interval in &intervals {
        h.source.serve(interval, Asset::Image { valid: 100 });
    }
    h.source.serve(7, Asset::Image { valid: 20 });
    h.source.serve(12, Asset::Unreachable);

    let report = h.pipeline.ingest_tile(&tile(), &intervals, false);
    assert_eq!(report.outcomes.len(), 20);
    assert_eq!(report.count("stored"), 18);
    assert_eq!(report.count("rejected"), 1);
    assert_eq!(report.count("transient_error"), 1);
    assert_eq!(h.source.calls(), 20);

    let recorded: Vec<u32> = h.ledger.list(&tile()).unwrap().iter().map(|r| r.interval).collect();
    assert_eq!(recorded, vec![7]);

    let stored: HashSet<u32> = h.store.list_intervals(&tile()).unwrap().into_iter().collect();
    assert_eq!(stored.len(), 18);
    assert!(!stored.contains(&7) && !stored.contains(&12));

    let again = h.pipeline.ingest_tile(&tile(), &intervals, false);
    assert_eq!(again.count("already_present"), 18);
    assert_eq!(again.count("skipped_invalid"), 1);
    assert_eq!(again.count("transient_error"), 1);
}

/// Start one request, wait until it is downloading, then send `followers`
/// more for the same interval. Returns the leader's outcome first.
fn ingest_concurrently(h: Harness, interval: u32, followers: usize) -> (Arc<FakeSource>, Vec<IngestOutcome>) {
    let pipeline = Arc::new(h.pipeline);
    let spawn = |pipeline: &Arc<IngestPipeline>| {
        let pipeline = Arc::clone(pipeline);
        std::thread::spawn(move || pipeline.ingest(&tile(), interval, false).unwrap())
    };

    let leader = spawn(&pipeline);
    while h.source.calls() == 0 {
        std::thread::sleep(Duration::from_millis(5));
    }
    let joined: Vec<_> = (0..followers).map(|_| spawn(&pipeline)).collect();

    let mut outcomes = vec![leader.join().unwrap()];
    outcomes.extend(joined.into_iter().map(|handle| handle.join().unwrap()));
    (h.source, outcomes)
}

#[test]
fn test_concurrent_requests_share_one_download() {
    let h = harness(FakeSource::new().with_delay(Duration::from_millis(300)));
    h.source.serve(42, Asset::Image { valid: 100 });

    let (source, outcomes) = ingest_concurrently(h, 42, 3);
    assert_eq!(source.calls(), 1);
    assert!(matches!(outcomes[0], IngestOutcome::Stored { .. }));
    assert!(outcomes.iter().all(|outcome| *outcome == outcomes[0]));
}

#[test]
fn test_concurrent_requests_share_a_rejection() {
    let h = harness(FakeSource::new().with_delay(Duration::from_millis(300)));
    h.source.serve(43, Asset::Image { valid: 5 });

    let (source, outcomes) = ingest_concurrently(h, 43, 2);
    assert_eq!(source.calls(), 1);
    assert!(matches!(outcomes[0], IngestOutcome::Rejected { .. }));
    assert!(outcomes.iter().all(|outcome| outcome.label() == "rejected" && *outcome == outcomes[0]));
}

#[test]
fn test_concurrent_requests_share_a_transport_failure() {
    let h = harness(FakeSource::new().with_delay(Duration::from_millis(300)));

    let (source, outcomes) = ingest_concurrently(h, 44, 2);
    assert_eq!(source.calls(), 1, "failure is not downloaded again by the waiters");
    assert!(outcomes.iter().all(|outcome| outcome.label() == "transient_error" && *outcome == outcomes[0]));
}

#[test]
fn test_tile_threshold_override() {
    let h = harness(FakeSource::new());
    h.source.serve(1, Asset::Image { valid: 60 });
    h.ledger.set_min_valid_fraction(&tile(), 0.5).unwrap();

    assert!(matches!(h.pipeline.ingest(&tile(), 1, false).unwrap(), IngestOutcome::Stored { .. }));
}

#[test]
fn test_staging_is_cleaned_up() {
    let h = harness(FakeSource::new());
    h.source.serve(1, Asset::Image { valid: 100 });
    h.source.serve(2, Asset::Image { valid: 1 });
    h.source.serve(3, Asset::Garbage);
    h.pipeline.ingest_tile(&tile(), &[1, 2, 3], false);

    let staging = h.dir.path().join("staging");
    assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
}
