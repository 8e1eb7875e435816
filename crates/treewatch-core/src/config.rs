//! Pipeline configuration.
//!
//! Settings are read from a YAML file in which every section and field is
//! optional. Secrets can be supplied through the environment instead of the
//! file:
//!
//! | Variable                    | Field              |
//! |-----------------------------|--------------------|
//! | `TREEWATCH_SOURCE_PASSWORD` | `source.password`  |
//! | `TREEWATCH_SIGNING_KEY`     | `store.signing_key`|
//!
//! ```yaml
//! source:
//!   username: glad
//! store:
//!   root: /srv/treewatch/artifacts
//!   public_base_url: https://tiles.example.org
//! ingest:
//!   min_valid_fraction: 0.7
//! processing:
//!   block_size: 500
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the source archive password.
pub const ENV_SOURCE_PASSWORD: &str = "TREEWATCH_SOURCE_PASSWORD";
/// Environment variable holding the URL signing key.
pub const ENV_SIGNING_KEY: &str = "TREEWATCH_SIGNING_KEY";

/// All pipeline settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Interval table source.
    pub registry: RegistrySettings,
    /// Raw imagery archive.
    pub source: SourceSettings,
    /// Artifact store.
    pub store: StoreSettings,
    /// Invalid-image ledger.
    pub ledger: LedgerSettings,
    /// Ingestion policy.
    pub ingest: IngestSettings,
    /// Temporal processing policy.
    pub processing: ProcessingSettings,
    /// Catalog cache.
    pub catalog: CatalogSettings,
}

/// Where the interval table comes from.
///
/// With neither `path` nor `url` set the GLAD 16-day table is generated for
/// `first_year..=last_year`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// JSON table on disk.
    pub path: Option<PathBuf>,
    /// JSON table served over HTTP(S).
    pub url: Option<String>,
    /// Disk cache for the remote table.
    pub cache_path: PathBuf,
    /// Age after which the cached remote table is refetched.
    pub cache_ttl_days: u64,
    /// First year of the generated table.
    pub first_year: i32,
    /// Last year of the generated table (defaults to the current year).
    pub last_year: Option<i32>,
    /// Publication lag: intervals ending within this many days are not yet eligible.
    pub lag_days: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            path: None,
            url: None,
            cache_path: PathBuf::from("data/interval_table.json"),
            cache_ttl_days: 7,
            first_year: 1997,
            last_year: None,
            lag_days: 20,
        }
    }
}

/// Raw imagery archive.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// Archive base URL.
    pub base_url: String,
    /// Basic auth user name.
    pub username: String,
    /// Basic auth password.
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Local staging directory for downloads and scratch rasters.
    pub staging_dir: PathBuf,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            base_url: treewatch_raster::DEFAULT_SOURCE_URL.to_string(),
            username: String::new(),
            password: None,
            timeout_secs: treewatch_raster::DEFAULT_TIMEOUT.as_secs(),
            staging_dir: std::env::temp_dir().join("treewatch"),
        }
    }
}

impl std::fmt::Debug for SourceSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSettings")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("timeout_secs", &self.timeout_secs)
            .field("staging_dir", &self.staging_dir)
            .finish()
    }
}

impl SourceSettings {
    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Artifact store.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Root directory of the store.
    pub root: PathBuf,
    /// Base URL under which the root is served.
    pub public_base_url: String,
    /// Key for signing artifact URLs.
    #[serde(skip_serializing)]
    pub signing_key: Option<String>,
    /// Lifetime of issued URLs in seconds.
    pub url_ttl_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/artifacts"),
            public_base_url: "http://localhost:8080/tiles".to_string(),
            signing_key: None,
            url_ttl_secs: 7 * 24 * 3600,
        }
    }
}

impl std::fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSettings")
            .field("root", &self.root)
            .field("public_base_url", &self.public_base_url)
            .field("signing_key", &self.signing_key.as_ref().map(|_| "***"))
            .field("url_ttl_secs", &self.url_ttl_secs)
            .finish()
    }
}

/// Invalid-image ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// SQLite database file.
    pub path: PathBuf,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/ledger.sqlite"),
        }
    }
}

/// Ingestion policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// Quality flag values that mark a pixel as valid.
    pub accepted_quality_codes: Vec<u16>,
    /// Images with a lower valid fraction are rejected.
    pub min_valid_fraction: f64,
    /// Rows per strip of published raw artifacts.
    pub rows_per_strip: u32,
    /// Maximum overview levels of published artifacts.
    pub max_overviews: u8,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            // Clear-sky land and water codes of the GLAD quality band
            accepted_quality_codes: vec![1, 2, 11, 12],
            min_valid_fraction: 0.7,
            rows_per_strip: treewatch_raster::DEFAULT_ROWS_PER_STRIP,
            max_overviews: 4,
        }
    }
}

/// Temporal processing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingSettings {
    /// Side of the square processing block in pixels.
    pub block_size: u32,
    /// Worker threads for block processing (defaults to the number of CPUs).
    pub threads: Option<usize>,
    /// Drop below the running peak that counts as loss.
    pub cut_threshold: f32,
    /// Floor for the loss trigger, the index of dense canopy.
    pub tree_lower_bound: f32,
    /// Window of the centered rolling mean along time. Odd.
    pub smoothing_window: usize,
    /// Trailing window over which a flat cumulative count means stabilization.
    pub stabilization_window: usize,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            block_size: 500,
            threads: None,
            cut_threshold: 0.25,
            tree_lower_bound: 0.7,
            smoothing_window: 3,
            stabilization_window: 3,
        }
    }
}

/// Catalog cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    /// Hours between background rebuilds.
    pub refresh_hours: u64,
    /// Attribution strings served with the catalog.
    pub attributions: Vec<String>,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            refresh_hours: 24,
            attributions: vec![
                "Landsat ARD: Global Land Analysis and Discovery (GLAD), University of Maryland".to_string(),
            ],
        }
    }
}

impl CatalogSettings {
    /// Rebuild cadence.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_hours * 3600)
    }
}

impl Settings {
    /// Load settings from a YAML file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings = Self::from_yaml(&text)?;
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from YAML text without environment overrides or validation.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Apply secrets from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply secrets from a custom environment source.
    pub fn apply_env_with<F>(&mut self, get_env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(password) = get_env(ENV_SOURCE_PASSWORD).filter(|v| !v.is_empty()) {
            self.source.password = Some(password);
        }
        if let Some(key) = get_env(ENV_SIGNING_KEY).filter(|v| !v.is_empty()) {
            self.store.signing_key = Some(key);
        }
    }

    /// Check that policy values are in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fraction = |field: &'static str, value: f64| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(ConfigError::Invalid {
                    field,
                    reason: format!("{} is outside [0, 1]", value),
                })
            }
        };
        let positive = |field: &'static str, value: u64| {
            if value > 0 {
                Ok(())
            } else {
                Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                })
            }
        };

        fraction("ingest.min_valid_fraction", self.ingest.min_valid_fraction)?;
        fraction("processing.cut_threshold", f64::from(self.processing.cut_threshold))?;
        fraction("processing.tree_lower_bound", f64::from(self.processing.tree_lower_bound))?;
        positive("processing.block_size", u64::from(self.processing.block_size))?;
        positive("processing.smoothing_window", self.processing.smoothing_window as u64)?;
        positive("processing.stabilization_window", self.processing.stabilization_window as u64)?;
        positive("ingest.rows_per_strip", u64::from(self.ingest.rows_per_strip))?;
        positive("catalog.refresh_hours", self.catalog.refresh_hours)?;
        positive("source.timeout_secs", self.source.timeout_secs)?;

        if self.processing.smoothing_window % 2 == 0 {
            return Err(ConfigError::Invalid {
                field: "processing.smoothing_window",
                reason: format!("{} is even; a centered window needs an odd length", self.processing.smoothing_window),
            });
        }
        if self.ingest.accepted_quality_codes.is_empty() {
            return Err(ConfigError::Invalid {
                field: "ingest.accepted_quality_codes",
                reason: "at least one code is required".to_string(),
            });
        }
        if self.processing.threads == Some(0) {
            return Err(ConfigError::Invalid {
                field: "processing.threads",
                reason: "must be greater than zero".to_string(),
            });
        }
        if let Some(last) = self.registry.last_year {
            if last < self.registry.first_year {
                return Err(ConfigError::Invalid {
                    field: "registry.last_year",
                    reason: format!("{} is before first_year {}", last, self.registry.first_year),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.ingest.min_valid_fraction, 0.7);
        assert_eq!(settings.processing.cut_threshold, 0.25);
        assert_eq!(settings.processing.tree_lower_bound, 0.7);
        assert_eq!(settings.registry.lag_days, 20);
        assert_eq!(settings.catalog.refresh_interval(), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let settings = Settings::from_yaml(
            "ingest:\n  min_valid_fraction: 0.5\nprocessing:\n  block_size: 256\n",
        )
        .unwrap();
        assert_eq!(settings.ingest.min_valid_fraction, 0.5);
        assert_eq!(settings.ingest.accepted_quality_codes, IngestSettings::default().accepted_quality_codes);
        assert_eq!(settings.processing.block_size, 256);
        assert_eq!(settings.processing.smoothing_window, 3);
        assert_eq!(settings.registry.cache_ttl_days, 7);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let settings = Settings::from_yaml("  \n").unwrap();
        assert_eq!(settings.store.root, PathBuf::from("data/artifacts"));
    }

    #[test]
    fn test_env_overrides_secrets() {
        let mut settings = Settings::default();
        settings.apply_env_with(|key| match key {
            ENV_SOURCE_PASSWORD => Some("s3cret".to_string()),
            ENV_SIGNING_KEY => Some(String::new()),
            _ => None,
        });
        assert_eq!(settings.source.password.as_deref(), Some("s3cret"));
        assert_eq!(settings.store.signing_key, None);
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let mut settings = Settings::default();
        settings.ingest.min_valid_fraction = 1.5;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid { field: "ingest.min_valid_fraction", .. })
        ));

        let mut settings = Settings::default();
        settings.processing.block_size = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.ingest.accepted_quality_codes.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_smoothing_window_must_be_odd() {
        for window in [2, 4] {
            let yaml = format!("processing:\n  smoothing_window: {}\n", window);
            let mut settings = Settings::from_yaml(&yaml).unwrap();
            assert!(matches!(
                settings.validate(),
                Err(ConfigError::Invalid { field: "processing.smoothing_window", .. })
            ));
            settings.processing.smoothing_window = window + 1;
            assert!(settings.validate().is_ok());
        }
    }

    #[test]
    fn test_unknown_field_type_is_parse_error() {
        let err = Settings::from_yaml("processing:\n  block_size: big\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_secrets_not_serialized() {
        let mut settings = Settings::default();
        settings.source.password = Some("hunter2".to_string());
        settings.store.signing_key = Some("k".to_string());
        let yaml = serde_yaml::to_string(&settings).unwrap();
        assert!(!yaml.contains("hunter2"));
        assert!(!format!("{:?}", settings).contains("hunter2"));
    }
}
