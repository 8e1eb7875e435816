//! Interval registry: the provider's 16-day interval table.
//!
//! The table maps each interval id to the date its composite window ends.
//! A registry is loaded once, after which every lookup is served from memory
//! and cannot fail. [`IntervalRegistry::refresh`] swaps in a newly loaded table
//! (a new epoch); readers holding the previous [`IntervalTable`] are unaffected.

use crate::config::RegistrySettings;
use crate::error::RegistryError;
use chrono::{Datelike, Days, NaiveDate};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use treewatch_metrics::metric_defs;

/// Interval identifier.
pub type IntervalId = u32;

/// Year the GLAD interval numbering starts from.
pub const GLAD_EPOCH_YEAR: i32 = 1980;

/// Intervals per year in the GLAD 16-day scheme.
pub const GLAD_INTERVALS_PER_YEAR: u32 = 23;

/// (month, day) on which each of the 23 yearly intervals ends.
const GLAD_END_DAYS: [(u32, u32); 23] = [
    (1, 16),
    (2, 1),
    (2, 17),
    (3, 5),
    (3, 21),
    (4, 6),
    (4, 22),
    (5, 8),
    (5, 24),
    (6, 9),
    (6, 25),
    (7, 11),
    (7, 27),
    (8, 12),
    (8, 28),
    (9, 13),
    (9, 29),
    (10, 15),
    (10, 31),
    (11, 16),
    (12, 2),
    (12, 18),
    (12, 31),
];

/// One row of the interval table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalRecord {
    /// Interval identifier.
    pub id: IntervalId,
    /// Last day covered by the interval.
    pub end_date: NaiveDate,
}

/// An immutable, validated interval table, ordered by id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IntervalTable {
    records: Vec<IntervalRecord>,
    by_id: BTreeMap<IntervalId, NaiveDate>,
}

#[derive(Serialize, Deserialize)]
struct TableFile {
    intervals: Vec<IntervalRecord>,
}

impl IntervalTable {
    /// Build a table, checking ids are unique and dates increase with ids.
    pub fn new(mut records: Vec<IntervalRecord>) -> Result<Self, RegistryError> {
        if records.is_empty() {
            return Err(RegistryError::Invalid("table has no intervals".to_string()));
        }
        records.sort_by_key(|r| r.id);
        for pair in records.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(RegistryError::Invalid(format!("duplicate interval id {}", pair[0].id)));
            }
            if pair[0].end_date >= pair[1].end_date {
                return Err(RegistryError::Invalid(format!(
                    "interval {} ends {} which is not before interval {} ending {}",
                    pair[0].id, pair[0].end_date, pair[1].id, pair[1].end_date
                )));
            }
        }
        let by_id = records.iter().map(|r| (r.id, r.end_date)).collect();
        Ok(Self { records, by_id })
    }

    /// Generate the GLAD 16-day table for `first_year..=last_year`.
    ///
    /// Interval `k` (0-based) of `year` has id `(year - 1980) * 23 + k + 1`.
    pub fn glad_16_day(first_year: i32, last_year: i32) -> Self {
        let records: Vec<IntervalRecord> = (first_year.max(GLAD_EPOCH_YEAR)..=last_year)
            .flat_map(|year| {
                GLAD_END_DAYS.iter().enumerate().filter_map(move |(k, &(month, day))| {
                    let id = (year - GLAD_EPOCH_YEAR) as u32 * GLAD_INTERVALS_PER_YEAR + k as u32 + 1;
                    NaiveDate::from_ymd_opt(year, month, day).map(|end_date| IntervalRecord { id, end_date })
                })
            })
            .collect();
        let by_id = records.iter().map(|r| (r.id, r.end_date)).collect();
        Self { records, by_id }
    }

    /// Parse a JSON table of the form `{"intervals": [{"id": 1, "end_date": "1980-01-16"}]}`.
    pub fn from_json(text: &str) -> Result<Self, RegistryError> {
        let file: TableFile = serde_json::from_str(text)?;
        Self::new(file.intervals)
    }

    /// Serialize to the JSON table format.
    pub fn to_json(&self) -> Result<String, RegistryError> {
        Ok(serde_json::to_string_pretty(&TableFile {
            intervals: self.records.clone(),
        })?)
    }

    /// Rows in id order.
    pub fn records(&self) -> &[IntervalRecord] {
        &self.records
    }

    /// Number of intervals.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Ordered ids and the id to date map.
    pub fn resolve(&self) -> (Vec<IntervalId>, BTreeMap<IntervalId, NaiveDate>) {
        (self.records.iter().map(|r| r.id).collect(), self.by_id.clone())
    }

    /// End date of an interval.
    pub fn date_of(&self, id: IntervalId) -> Option<NaiveDate> {
        self.by_id.get(&id).copied()
    }

    /// The interval whose end date is the first on or after `date`.
    pub fn interval_for_date(&self, date: NaiveDate) -> Option<IntervalId> {
        let index = self.records.partition_point(|r| r.end_date < date);
        self.records.get(index).map(|r| r.id)
    }

    /// Intervals ending strictly before `today - lag_days`, ascending.
    pub fn eligible_intervals(&self, lag_days: u64, today: NaiveDate) -> Vec<IntervalId> {
        let cutoff = today.checked_sub_days(Days::new(lag_days)).unwrap_or(NaiveDate::MIN);
        self.records
            .iter()
            .take_while(|r| r.end_date < cutoff)
            .map(|r| r.id)
            .collect()
    }
}

/// Where an interval table is loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSource {
    /// JSON file on disk.
    File(PathBuf),
    /// JSON served over HTTP(S), cached on disk.
    Remote {
        /// Table URL.
        url: String,
        /// Cache file.
        cache_path: PathBuf,
        /// Age after which the cache is refetched.
        ttl: Duration,
    },
    /// Generated GLAD 16-day table.
    Generated {
        /// First year.
        first_year: i32,
        /// Last year.
        last_year: i32,
    },
}

impl TableSource {
    /// Choose the source described by the settings.
    pub fn from_settings(settings: &RegistrySettings, today: NaiveDate) -> Self {
        if let Some(path) = &settings.path {
            TableSource::File(path.clone())
        } else if let Some(url) = &settings.url {
            TableSource::Remote {
                url: url.clone(),
                cache_path: settings.cache_path.clone(),
                ttl: Duration::from_secs(settings.cache_ttl_days * 24 * 3600),
            }
        } else {
            TableSource::Generated {
                first_year: settings.first_year,
                last_year: settings.last_year.unwrap_or_else(|| today.year()),
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            TableSource::File(path) => path.display().to_string(),
            TableSource::Remote { url, .. } => url.clone(),
            TableSource::Generated { first_year, last_year } => {
                format!("generated GLAD table {}-{}", first_year, last_year)
            }
        }
    }

    /// Load the table. Performs I/O.
    pub fn load(&self) -> Result<IntervalTable, RegistryError> {
        match self {
            TableSource::File(path) => {
                let table = IntervalTable::from_json(&std::fs::read_to_string(path)?)?;
                record_load("file");
                Ok(table)
            }
            TableSource::Remote { url, cache_path, ttl } => load_remote(url, cache_path, *ttl),
            TableSource::Generated { first_year, last_year } => {
                let table = IntervalTable::glad_16_day(*first_year, *last_year);
                if table.is_empty() {
                    return Err(RegistryError::Invalid(format!(
                        "no intervals between {} and {}",
                        first_year, last_year
                    )));
                }
                record_load("generated");
                Ok(table)
            }
        }
    }
}

fn record_load(origin: &'static str) {
    metrics::counter!(metric_defs::REGISTRY_LOADS.name, "origin" => origin).increment(1);
}

fn cache_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

fn load_remote(url: &str, cache_path: &Path, ttl: Duration) -> Result<IntervalTable, RegistryError> {
    if cache_age(cache_path).is_some_and(|age| age < ttl) {
        let cached = std::fs::read_to_string(cache_path)
            .map_err(RegistryError::from)
            .and_then(|t| IntervalTable::from_json(&t));
        match cached {
            Ok(table) => {
                tracing::debug!(path = %cache_path.display(), "using cached interval table");
                record_load("cache");
                return Ok(table);
            }
            Err(e) => tracing::warn!(path = %cache_path.display(), error = %e, "ignoring unreadable interval cache"),
        }
    }

    match fetch_remote(url) {
        Ok((table, text)) => {
            if let Some(parent) = cache_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(cache_path, text)?;
            tracing::info!(%url, intervals = table.len(), "downloaded interval table");
            record_load("remote");
            Ok(table)
        }
        Err(fetch_error) => {
            // Stale cache beats no table at all
            let stale = std::fs::read_to_string(cache_path)
                .map_err(RegistryError::from)
                .and_then(|t| IntervalTable::from_json(&t));
            match stale {
                Ok(table) => {
                    tracing::warn!(%url, error = %fetch_error, "interval table fetch failed, using stale cache");
                    record_load("cache");
                    Ok(table)
                }
                Err(_) => Err(RegistryError::Unavailable {
                    source_name: url.to_string(),
                    reason: fetch_error.to_string(),
                }),
            }
        }
    }
}

fn fetch_remote(url: &str) -> Result<(IntervalTable, String), RegistryError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;
    let text = client.get(url).send()?.error_for_status()?.text()?;
    let table = IntervalTable::from_json(&text)?;
    Ok((table, text))
}

/// The loaded interval table plus the source to reload it from.
#[derive(Debug)]
pub struct IntervalRegistry {
    source: TableSource,
    table: RwLock<Arc<IntervalTable>>,
}

impl IntervalRegistry {
    /// Load the registry. Failure is fatal for the caller.
    pub fn load(source: TableSource) -> Result<Self, RegistryError> {
        let table = source.load().map_err(|e| match e {
            RegistryError::Unavailable { .. } => e,
            other => RegistryError::Unavailable {
                source_name: source.describe(),
                reason: other.to_string(),
            },
        })?;
        tracing::info!(source = %source.describe(), intervals = table.len(), "loaded interval registry");
        Ok(Self {
            source,
            table: RwLock::new(Arc::new(table)),
        })
    }

    /// Build a registry around an existing table.
    pub fn from_table(table: IntervalTable) -> Self {
        let source = match (table.records.first(), table.records.last()) {
            (Some(first), Some(last)) => TableSource::Generated {
                first_year: first.end_date.year(),
                last_year: last.end_date.year(),
            },
            _ => TableSource::Generated {
                first_year: GLAD_EPOCH_YEAR,
                last_year: GLAD_EPOCH_YEAR,
            },
        };
        Self {
            source,
            table: RwLock::new(Arc::new(table)),
        }
    }

    /// Reload the table from its source, starting a new epoch.
    ///
    /// On failure the current epoch stays in place.
    pub fn refresh(&self) -> Result<(), RegistryError> {
        let table = self.source.load()?;
        tracing::info!(intervals = table.len(), "refreshed interval registry");
        *self.table.write() = Arc::new(table);
        Ok(())
    }

    /// The table of the current epoch.
    pub fn table(&self) -> Arc<IntervalTable> {
        Arc::clone(&self.table.read())
    }

    /// Ordered ids and the id to date map.
    pub fn resolve(&self) -> (Vec<IntervalId>, BTreeMap<IntervalId, NaiveDate>) {
        self.table().resolve()
    }

    /// Intervals ending strictly before `today - lag_days`, ascending.
    pub fn eligible_intervals(&self, lag_days: u64, today: NaiveDate) -> Vec<IntervalId> {
        self.table().eligible_intervals(lag_days, today)
    }

    /// End date of an interval.
    pub fn date_of(&self, id: IntervalId) -> Option<NaiveDate> {
        self.table().date_of(id)
    }

    /// The interval whose end date is the first on or after `date`.
    pub fn interval_for_date(&self, date: NaiveDate) -> Option<IntervalId> {
        self.table().interval_for_date(date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_glad_ids_and_dates() {
        let table = IntervalTable::glad_16_day(2020, 2021);
        assert_eq!(table.len(), 46);
        // First interval of 2020
        assert_eq!(table.date_of(921), Some(date(2020, 1, 16)));
        assert_eq!(table.date_of(943), Some(date(2020, 12, 31)));
        assert_eq!(table.date_of(944), Some(date(2021, 1, 16)));
        assert_eq!(table.date_of(920), None);
    }

    #[test]
    fn test_interval_for_date() {
        let table = IntervalTable::glad_16_day(2020, 2020);
        assert_eq!(table.interval_for_date(date(2020, 1, 1)), Some(921));
        assert_eq!(table.interval_for_date(date(2020, 1, 16)), Some(921));
        assert_eq!(table.interval_for_date(date(2020, 1, 17)), Some(922));
        assert_eq!(table.interval_for_date(date(2021, 1, 1)), None);
    }

    #[test]
    fn test_eligible_is_strictly_before_lag() {
        let table = IntervalTable::glad_16_day(2020, 2020);
        // today - 20 days = 2020-02-05; interval ending 2020-02-01 qualifies, 2020-02-17 does not
        let eligible = table.eligible_intervals(20, date(2020, 2, 25));
        assert_eq!(eligible, vec![921, 922]);
        // Cutoff exactly on an end date excludes it
        let eligible = table.eligible_intervals(0, date(2020, 2, 1));
        assert_eq!(eligible, vec![921]);
    }

    #[test]
    fn test_table_validation() {
        let dup = vec![
            IntervalRecord { id: 1, end_date: date(2020, 1, 1) },
            IntervalRecord { id: 1, end_date: date(2020, 2, 1) },
        ];
        assert!(IntervalTable::new(dup).is_err());

        let unordered = vec![
            IntervalRecord { id: 1, end_date: date(2020, 3, 1) },
            IntervalRecord { id: 2, end_date: date(2020, 2, 1) },
        ];
        assert!(IntervalTable::new(unordered).is_err());
        assert!(IntervalTable::new(Vec::new()).is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let table = IntervalTable::glad_16_day(2019, 2019);
        let parsed = IntervalTable::from_json(&table.to_json().unwrap()).unwrap();
        assert_eq!(parsed, table);
    }

    #[test]
    fn test_refresh_swaps_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.json");
        std::fs::write(&path, IntervalTable::glad_16_day(2020, 2020).to_json().unwrap()).unwrap();

        let registry = IntervalRegistry::load(TableSource::File(path.clone())).unwrap();
        let old = registry.table();
        assert_eq!(old.len(), 23);

        std::fs::write(&path, IntervalTable::glad_16_day(2020, 2021).to_json().unwrap()).unwrap();
        registry.refresh().unwrap();
        assert_eq!(registry.table().len(), 46);
        // Holders of the previous epoch are unaffected
        assert_eq!(old.len(), 23);

        std::fs::write(&path, "not json").unwrap();
        assert!(registry.refresh().is_err());
        assert_eq!(registry.table().len(), 46);
    }

    #[test]
    fn test_missing_source_is_unavailable() {
        let err = IntervalRegistry::load(TableSource::File(PathBuf::from("/nonexistent/table.json"))).unwrap_err();
        assert!(matches!(err, RegistryError::Unavailable { .. }));
    }

    #[test]
    fn test_remote_falls_back_to_stale_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.json");
        std::fs::write(&cache_path, IntervalTable::glad_16_day(2020, 2020).to_json().unwrap()).unwrap();

        // Zero TTL forces a fetch; the URL cannot be reached so the stale cache is used
        let source = TableSource::Remote {
            url: "http://127.0.0.1:9/intervals.json".to_string(),
            cache_path,
            ttl: Duration::ZERO,
        };
        let registry = IntervalRegistry::load(source).unwrap();
        assert_eq!(registry.table().len(), 23);
    }

    #[test]
    fn test_from_settings() {
        let today = date(2024, 6, 1);
        let settings = RegistrySettings::default();
        assert_eq!(
            TableSource::from_settings(&settings, today),
            TableSource::Generated {
                first_year: 1997,
                last_year: 2024
            }
        );

        let settings = RegistrySettings {
            url: Some("https://example.org/t.json".to_string()),
            ..Default::default()
        };
        assert!(matches!(TableSource::from_settings(&settings, today), TableSource::Remote { .. }));
    }
}
