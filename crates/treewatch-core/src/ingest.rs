//! Ingestion of raw imagery, one (tile, interval) at a time.
//!
//! Each request walks an explicit state machine:
//!
//! ```text
//! LedgerCheck -> StoreCheck -> Download -> Validate -> Publish -> Done
//!      |             |            |           |
//!      v             v            v           v
//!  SkipInvalid  AlreadyPresent  Transient   Reject
//! ```
//!
//! Every path ends in an [`IngestOutcome`]. Quality rejections are recorded in
//! the ledger; transport failures are not, so they are retried on the next run.
//!
//! ## Thread Safety
//!
//! Concurrent requests for the same (tile, interval) are coalesced: the first
//! runs the state machine while the others wait and then report its outcome,
//! so one download serves all of them. A waiter runs the state machine itself
//! only when the first request ended in an error, or when the waiter asked for
//! a retry and the first request was skipped.

use crate::config::IngestSettings;
use crate::error::CoreError;
use crate::ledger::InvalidImageLedger;
use crate::params::TileParamStore;
use crate::registry::IntervalId;
use crate::staging::StagedFile;
use crate::store::{ArtifactKey, ArtifactStore, ProductLevel};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use treewatch_metrics::{metric_defs, TileLabels};
use treewatch_raster::{write_layout, LayoutOptions, Raster, SourceFetcher, TileId};

/// Bands in a raw GLAD ARD image.
pub const RAW_BAND_COUNT: usize = 8;

/// Index of the quality flag band.
pub const QUALITY_BAND: usize = 7;

/// Nodata sentinel of raw imagery.
pub const RAW_NODATA: u16 = 0;

/// Result of ingesting one (tile, interval).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Downloaded, validated and published.
    Stored {
        /// Size of the published artifact.
        bytes: u64,
        /// Fraction of valid pixels.
        valid_fraction: f64,
    },
    /// The raw artifact was already in the store; nothing was downloaded.
    AlreadyPresent,
    /// A ledger record blocks this image and no retry was requested.
    SkippedInvalid {
        /// Reason stored in the ledger.
        reason: String,
        /// Valid fraction stored in the ledger.
        valid_fraction: f64,
    },
    /// The image failed validation or conversion and was recorded in the ledger.
    Rejected {
        /// Why the image was rejected.
        reason: String,
        /// Fraction of valid pixels (0 when undecodable).
        valid_fraction: f64,
    },
    /// Download or storage failed; worth retrying later.
    TransientError {
        /// Error description.
        error: String,
    },
}

impl IngestOutcome {
    /// Short label used in metrics and reports.
    pub const fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Stored { .. } => "stored",
            IngestOutcome::AlreadyPresent => "already_present",
            IngestOutcome::SkippedInvalid { .. } => "skipped_invalid",
            IngestOutcome::Rejected { .. } => "rejected",
            IngestOutcome::TransientError { .. } => "transient_error",
        }
    }

    /// Whether the raw artifact is present after this outcome.
    pub const fn is_present(&self) -> bool {
        matches!(self, IngestOutcome::Stored { .. } | IngestOutcome::AlreadyPresent)
    }
}

impl fmt::Display for IngestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestOutcome::Stored { bytes, valid_fraction } => {
                write!(f, "stored ({} bytes, {:.1}% valid)", bytes, valid_fraction * 100.0)
            }
            IngestOutcome::AlreadyPresent => write!(f, "already present"),
            IngestOutcome::SkippedInvalid { reason, .. } => write!(f, "skipped, previously rejected: {}", reason),
            IngestOutcome::Rejected { reason, .. } => write!(f, "rejected: {}", reason),
            IngestOutcome::TransientError { error } => write!(f, "transient error: {}", error),
        }
    }
}

/// Outcomes of a batch for one tile, in interval order.
#[derive(Debug, Clone, Serialize)]
pub struct TileReport {
    /// Tile identifier.
    pub tile: TileId,
    /// Per-interval outcomes.
    pub outcomes: Vec<(IntervalId, IngestOutcome)>,
}

impl TileReport {
    /// Number of outcomes with the given label.
    pub fn count(&self, label: &str) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.label() == label).count()
    }
}

/// Quality and layout policy for ingestion.
#[derive(Debug, Clone)]
pub struct IngestPolicy {
    /// Quality flag values that mark a pixel as valid.
    pub accepted_quality_codes: Vec<u16>,
    /// Images with a lower valid fraction are rejected.
    pub min_valid_fraction: f64,
    /// Rows per strip of published artifacts.
    pub rows_per_strip: u32,
    /// Maximum overview levels.
    pub max_overviews: u8,
}

impl Default for IngestPolicy {
    fn default() -> Self {
        Self::from(&IngestSettings::default())
    }
}

impl From<&IngestSettings> for IngestPolicy {
    fn from(settings: &IngestSettings) -> Self {
        Self {
            accepted_quality_codes: settings.accepted_quality_codes.clone(),
            min_valid_fraction: settings.min_valid_fraction,
            rows_per_strip: settings.rows_per_strip,
            max_overviews: settings.max_overviews,
        }
    }
}

/// Per-pixel validity: true where the quality flag is accepted.
pub fn quality_mask(quality: &[u16], accepted: &[u16]) -> Vec<bool> {
    quality.iter().map(|flag| accepted.contains(flag)).collect()
}

/// Fraction of valid pixels in a mask. An empty mask has no valid pixels.
pub fn valid_fraction(mask: &[bool]) -> f64 {
    if mask.is_empty() {
        return 0.0;
    }
    mask.iter().filter(|&&valid| valid).count() as f64 / mask.len() as f64
}

/// Set every band of invalid pixels to the nodata sentinel.
pub fn normalize_invalid(raster: &mut Raster<u16>, mask: &[bool]) {
    for band in 0..raster.band_count() {
        for (value, &valid) in raster.band_mut(band).iter_mut().zip(mask) {
            if !valid {
                *value = RAW_NODATA;
            }
        }
    }
}

/// Outcome slot of one running request, shared with the requests that joined it.
#[derive(Default)]
struct Slot {
    /// `None` while running. `Some(None)` when the leader ended in an error.
    finished: Mutex<Option<Option<IngestOutcome>>>,
    done: Condvar,
}

/// In-flight (tile, interval) requests.
struct InFlight {
    slots: Mutex<HashMap<(TileId, IntervalId), Arc<Slot>>>,
}

enum Claim<'a> {
    /// Nobody else is working on the key; run the state machine.
    Leader(InFlightGuard<'a>),
    /// Another request held the key; this is what it ended with.
    Follower(Option<IngestOutcome>),
}

impl InFlight {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Claim a key, or wait for its current holder and take its outcome.
    fn claim(&self, tile: &TileId, interval: IntervalId) -> Claim<'_> {
        let key = (tile.clone(), interval);
        let slot = {
            let mut slots = self.slots.lock();
            match slots.get(&key) {
                Some(slot) => Arc::clone(slot),
                None => {
                    let slot = Arc::new(Slot::default());
                    slots.insert(key.clone(), Arc::clone(&slot));
                    return Claim::Leader(InFlightGuard {
                        owner: self,
                        key,
                        slot,
                        outcome: None,
                    });
                }
            }
        };

        let mut finished = slot.finished.lock();
        while finished.is_none() {
            slot.done.wait(&mut finished);
        }
        Claim::Follower(finished.clone().flatten())
    }
}

struct InFlightGuard<'a> {
    owner: &'a InFlight,
    key: (TileId, IntervalId),
    slot: Arc<Slot>,
    outcome: Option<IngestOutcome>,
}

impl InFlightGuard<'_> {
    /// Hand `outcome` to the waiting requests when the guard drops.
    fn complete(&mut self, outcome: &IngestOutcome) {
        self.outcome = Some(outcome.clone());
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner.slots.lock().remove(&self.key);
        *self.slot.finished.lock() = Some(self.outcome.take());
        self.slot.done.notify_all();
    }
}

/// States of one ingestion request.
enum Step {
    LedgerCheck,
    StoreCheck,
    Download,
    Validate(StagedFile),
    Publish { raster: Raster<u16>, valid_fraction: f64 },
    Reject { reason: String, valid_fraction: f64 },
    Done(IngestOutcome),
}

/// Ingestion pipeline over a fetcher, an artifact store and a ledger.
pub struct IngestPipeline {
    fetcher: Arc<dyn SourceFetcher>,
    store: Arc<dyn ArtifactStore>,
    ledger: Arc<dyn InvalidImageLedger>,
    params: Option<Arc<dyn TileParamStore>>,
    policy: IngestPolicy,
    staging_dir: PathBuf,
    in_flight: InFlight,
}

impl fmt::Debug for IngestPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestPipeline")
            .field("policy", &self.policy)
            .field("staging_dir", &self.staging_dir)
            .finish_non_exhaustive()
    }
}

impl IngestPipeline {
    /// Create a pipeline.
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        store: Arc<dyn ArtifactStore>,
        ledger: Arc<dyn InvalidImageLedger>,
        policy: IngestPolicy,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fetcher,
            store,
            ledger,
            params: None,
            policy,
            staging_dir: staging_dir.into(),
            in_flight: InFlight::new(),
        }
    }

    /// Use per-tile overrides of the valid fraction threshold.
    pub fn with_params(mut self, params: Arc<dyn TileParamStore>) -> Self {
        self.params = Some(params);
        self
    }

    /// The policy in use.
    pub fn policy(&self) -> &IngestPolicy {
        &self.policy
    }

    fn min_valid_fraction(&self, tile: &TileId) -> Result<f64, CoreError> {
        match &self.params {
            Some(params) => Ok(params.min_valid_fraction(tile)?.unwrap_or(self.policy.min_valid_fraction)),
            None => Ok(self.policy.min_valid_fraction),
        }
    }

    /// Ingest one (tile, interval).
    ///
    /// With `retry` an existing ledger record is cleared first. Errors are
    /// returned only for ledger or store failures; everything else is an outcome.
    pub fn ingest(&self, tile: &TileId, interval: IntervalId, retry: bool) -> Result<IngestOutcome, CoreError> {
        loop {
            match self.in_flight.claim(tile, interval) {
                Claim::Leader(mut guard) => {
                    let outcome = self.run(tile, interval, retry)?;
                    guard.complete(&outcome);
                    metrics::counter!(
                        metric_defs::INGEST_OUTCOMES.name,
                        &TileLabels::new(tile.as_str()).with(&[("outcome", outcome.label().to_string())])
                    )
                    .increment(1);
                    return Ok(outcome);
                }
                Claim::Follower(outcome) => {
                    metrics::counter!(metric_defs::INGEST_COALESCED.name, &TileLabels::new(tile.as_str()).to_labels())
                        .increment(1);
                    match outcome {
                        // A skip does not answer a retry
                        Some(IngestOutcome::SkippedInvalid { .. }) if retry => {}
                        Some(outcome) => {
                            tracing::debug!(%tile, interval, outcome = outcome.label(), "joined in-flight ingest");
                            return Ok(outcome);
                        }
                        // The leader failed without an outcome; run again
                        None => {}
                    }
                }
            }
        }
    }

    fn run(&self, tile: &TileId, interval: IntervalId, retry: bool) -> Result<IngestOutcome, CoreError> {
        let key = ArtifactKey::new(tile.clone(), interval, ProductLevel::Raw);
        let mut step = Step::LedgerCheck;
        loop {
            step = match step {
                Step::LedgerCheck => match self.ledger.lookup(tile, interval)? {
                    Some(_) if retry => {
                        self.ledger.clear(tile, interval)?;
                        tracing::info!(%tile, interval, "cleared invalid image record for retry");
                        Step::StoreCheck
                    }
                    Some(record) => Step::Done(IngestOutcome::SkippedInvalid {
                        reason: record.reason,
                        valid_fraction: record.valid_pixel_fraction,
                    }),
                    None => Step::StoreCheck,
                },

                Step::StoreCheck => {
                    if self.store.exists(&key)? {
                        Step::Done(IngestOutcome::AlreadyPresent)
                    } else {
                        Step::Download
                    }
                }

                Step::Download => {
                    std::fs::create_dir_all(&self.staging_dir)?;
                    let staged = StagedFile::new(self.staging_path(tile, interval, "source"));
                    match self.fetcher.fetch(tile, interval, staged.path()) {
                        Ok(bytes) => {
                            metrics::counter!(
                                metric_defs::INGEST_BYTES_DOWNLOADED.name,
                                &TileLabels::new(tile.as_str()).to_labels()
                            )
                            .increment(bytes);
                            Step::Validate(staged)
                        }
                        Err(e) => {
                            tracing::warn!(%tile, interval, error = %e, "download failed");
                            Step::Done(IngestOutcome::TransientError { error: e.to_string() })
                        }
                    }
                }

                Step::Validate(staged) => self.validate(tile, staged.path())?,

                Step::Publish { mut raster, valid_fraction } => {
                    let mask = quality_mask(raster.band(QUALITY_BAND), &self.policy.accepted_quality_codes);
                    normalize_invalid(&mut raster, &mask);
                    let converted = StagedFile::new(self.staging_path(tile, interval, "raw"));
                    let options = LayoutOptions {
                        rows_per_strip: self.policy.rows_per_strip,
                        max_overviews: self.policy.max_overviews,
                        nodata: Some(f64::from(RAW_NODATA)),
                        bounds: Some(tile.bounds()),
                        ..Default::default()
                    };
                    match write_layout(converted.path(), &mut raster, &options) {
                        Ok(_) => {
                            let bytes = self.store.put_file(&key, converted.path())?;
                            metrics::counter!(
                                metric_defs::ARTIFACTS_PUBLISHED.name,
                                &TileLabels::new(tile.as_str()).with_level(ProductLevel::Raw.as_str()).to_labels()
                            )
                            .increment(1);
                            tracing::info!(%tile, interval, bytes, valid_fraction, "stored raw image");
                            Step::Done(IngestOutcome::Stored { bytes, valid_fraction })
                        }
                        Err(e) => Step::Reject {
                            reason: format!("conversion failed: {}", e),
                            valid_fraction,
                        },
                    }
                }

                Step::Reject { reason, valid_fraction } => {
                    self.ledger.record(tile, interval, &reason, valid_fraction)?;
                    tracing::warn!(%tile, interval, %reason, valid_fraction, "rejected image");
                    Step::Done(IngestOutcome::Rejected { reason, valid_fraction })
                }

                Step::Done(outcome) => return Ok(outcome),
            };
        }
    }

    fn validate(&self, tile: &TileId, staged: &Path) -> Result<Step, CoreError> {
        let raster = match Raster::<u16>::from_file(staged) {
            Ok(raster) => raster,
            Err(e) => {
                return Ok(Step::Reject {
                    reason: format!("undecodable image: {}", e),
                    valid_fraction: 0.0,
                })
            }
        };
        if raster.band_count() != RAW_BAND_COUNT {
            return Ok(Step::Reject {
                reason: format!("expected {} bands, found {}", RAW_BAND_COUNT, raster.band_count()),
                valid_fraction: 0.0,
            });
        }

        let mask = quality_mask(raster.band(QUALITY_BAND), &self.policy.accepted_quality_codes);
        let fraction = valid_fraction(&mask);
        metrics::histogram!(
            metric_defs::INGEST_VALID_FRACTION.name,
            &TileLabels::new(tile.as_str()).to_labels()
        )
        .record(fraction * 100.0);

        let threshold = self.min_valid_fraction(tile)?;
        if fraction >= threshold {
            Ok(Step::Publish {
                raster,
                valid_fraction: fraction,
            })
        } else {
            Ok(Step::Reject {
                reason: format!("valid pixel fraction {:.4} below threshold {:.4}", fraction, threshold),
                valid_fraction: fraction,
            })
        }
    }

    fn staging_path(&self, tile: &TileId, interval: IntervalId, suffix: &str) -> PathBuf {
        self.staging_dir.join(format!("{}_{}.{}.tif", tile, interval, suffix))
    }

    /// Ingest every interval in `intervals` for a tile.
    ///
    /// Never stops early: ledger and store failures for one interval are
    /// reported as transient errors for that interval and the batch continues.
    pub fn ingest_tile(&self, tile: &TileId, intervals: &[IntervalId], retry: bool) -> TileReport {
        tracing::info!(%tile, intervals = intervals.len(), retry, "ingesting tile");

        let outcomes: Vec<(IntervalId, IngestOutcome)> = intervals
            .iter()
            .map(|&interval| {
                let outcome = self.ingest(tile, interval, retry).unwrap_or_else(|e| {
                    tracing::warn!(%tile, interval, error = %e, "ingest failed");
                    IngestOutcome::TransientError { error: e.to_string() }
                });
                (interval, outcome)
            })
            .collect();

        let report = TileReport {
            tile: tile.clone(),
            outcomes,
        };
        tracing::info!(
            %tile,
            stored = report.count("stored"),
            already_present = report.count("already_present"),
            skipped = report.count("skipped_invalid"),
            rejected = report.count("rejected"),
            transient = report.count("transient_error"),
            "tile ingest finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_fraction() {
        let quality = [1u16, 2, 3, 4, 11, 2, 1, 1, 9, 12];
        let mask = quality_mask(&quality, &[1, 2, 11, 12]);
        assert_eq!(mask.iter().filter(|&&valid| valid).count(), 7);
        assert_eq!(valid_fraction(&mask), 0.7);
        assert_eq!(valid_fraction(&[]), 0.0);

        let mut quality = vec![1u16; 69];
        quality.extend(std::iter::repeat(9).take(31));
        let fraction = valid_fraction(&quality_mask(&quality, &[1, 2, 11, 12]));
        assert_eq!(fraction, 0.69);
        assert!(fraction < IngestPolicy::default().min_valid_fraction);
    }

    #[test]
    fn test_normalize_invalid_all_bands() {
        let mut raster = Raster::from_bands(3, 1, vec![vec![10u16, 20, 30], vec![1, 2, 3]]).unwrap();
        normalize_invalid(&mut raster, &[true, false, true]);
        assert_eq!(raster.band(0), &[10, 0, 30]);
        assert_eq!(raster.band(1), &[1, 0, 3]);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(IngestOutcome::AlreadyPresent.label(), "already_present");
        assert!(IngestOutcome::Stored { bytes: 1, valid_fraction: 1.0 }.is_present());
        assert!(!IngestOutcome::TransientError { error: String::new() }.is_present());

        let json = serde_json::to_string(&IngestOutcome::Rejected {
            reason: "cloudy".to_string(),
            valid_fraction: 0.5,
        })
        .unwrap();
        assert_eq!(json, r#"{"outcome":"rejected","reason":"cloudy","valid_fraction":0.5}"#);
    }

    #[test]
    fn test_in_flight_hands_outcome_to_waiters() {
        let in_flight = Arc::new(InFlight::new());
        let tile = TileId::parse("105W_40N").unwrap();

        let Claim::Leader(mut guard) = in_flight.claim(&tile, 1) else {
            panic!("first claim must lead");
        };
        let (tx, rx) = crossbeam_channel::bounded(1);
        let waiter = {
            let in_flight = Arc::clone(&in_flight);
            let tile = tile.clone();
            std::thread::spawn(move || {
                let outcome = match in_flight.claim(&tile, 1) {
                    Claim::Follower(outcome) => outcome,
                    Claim::Leader(_) => panic!("key was held"),
                };
                tx.send(outcome).unwrap();
            })
        };

        // Still blocked while the guard is held
        assert!(rx.recv_timeout(std::time::Duration::from_millis(50)).is_err());
        // A different key is independent
        assert!(matches!(in_flight.claim(&tile, 2), Claim::Leader(_)));

        let rejected = IngestOutcome::Rejected {
            reason: "cloudy".to_string(),
            valid_fraction: 0.2,
        };
        guard.complete(&rejected);
        drop(guard);
        assert_eq!(rx.recv().unwrap(), Some(rejected));
        waiter.join().unwrap();

        // Released: the next request leads again
        assert!(matches!(in_flight.claim(&tile, 1), Claim::Leader(_)));
    }

    #[test]
    fn test_in_flight_error_leaves_waiters_without_outcome() {
        let in_flight = InFlight::new();
        let tile = TileId::parse("105W_40N").unwrap();
        std::thread::scope(|scope| {
            let Claim::Leader(guard) = in_flight.claim(&tile, 1) else {
                panic!("first claim must lead");
            };
            let waiter = scope.spawn(|| matches!(in_flight.claim(&tile, 1), Claim::Follower(None)));
            std::thread::sleep(std::time::Duration::from_millis(50));
            drop(guard);
            assert!(waiter.join().unwrap());
        });
    }
}