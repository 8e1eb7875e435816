//! Pipeline components assembled from settings.

use anyhow::{Context as _, Result};
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use treewatch_core::{
    Catalog, FsArtifactStore, IngestPipeline, IngestPolicy, IntervalRegistry, ProcessorConfig, Settings, SqliteLedger,
    TableSource, TemporalProcessor,
};
use treewatch_raster::{Credentials, HttpSourceFetcher};

/// The store and ledger shared by every command, plus the settings to build the rest.
#[derive(Debug)]
pub struct Components {
    /// Effective settings.
    pub settings: Settings,
    /// Artifact store.
    pub store: Arc<FsArtifactStore>,
    /// Invalid-image ledger and per-tile overrides.
    pub ledger: Arc<SqliteLedger>,
}

impl Components {
    /// Open the store and the ledger.
    pub fn open(settings: Settings) -> Result<Self> {
        let store = FsArtifactStore::new(
            &settings.store.root,
            settings.store.public_base_url.clone(),
            settings.store.signing_key.clone(),
        )
        .with_context(|| format!("failed to open artifact store at {}", settings.store.root.display()))?;
        let ledger = SqliteLedger::open(&settings.ledger.path)
            .with_context(|| format!("failed to open ledger at {}", settings.ledger.path.display()))?;
        Ok(Self {
            settings,
            store: Arc::new(store),
            ledger: Arc::new(ledger),
        })
    }

    /// Load the interval registry. Failure aborts the command.
    pub fn registry(&self, today: NaiveDate) -> Result<IntervalRegistry> {
        let source = TableSource::from_settings(&self.settings.registry, today);
        IntervalRegistry::load(source).context("interval registry unavailable")
    }

    /// Ingestion pipeline over the configured archive.
    pub fn pipeline(&self) -> Result<IngestPipeline> {
        let source = &self.settings.source;
        let credentials = (!source.username.is_empty()).then(|| Credentials {
            username: source.username.clone(),
            password: source.password.clone(),
        });
        let fetcher = HttpSourceFetcher::new(source.base_url.clone(), credentials, source.timeout())
            .context("failed to build source client")?;

        Ok(IngestPipeline::new(
            Arc::new(fetcher),
            self.store.clone(),
            self.ledger.clone(),
            IngestPolicy::from(&self.settings.ingest),
            source.staging_dir.join("ingest"),
        )
        .with_params(self.ledger.clone()))
    }

    /// Temporal processor with per-tile change overrides.
    pub fn processor(&self) -> TemporalProcessor {
        let config = ProcessorConfig::new(&self.settings.processing, &self.settings.ingest);
        TemporalProcessor::new(self.store.clone(), config, self.settings.source.staging_dir.join("process"))
            .with_params(self.ledger.clone())
    }

    /// Catalog over the store.
    pub fn catalog(&self, registry: Arc<IntervalRegistry>) -> Catalog {
        Catalog::new(
            self.store.clone(),
            registry,
            self.settings.store.public_base_url.clone(),
            Duration::from_secs(self.settings.store.url_ttl_secs),
            self.settings.catalog.attributions.clone(),
        )
    }
}
