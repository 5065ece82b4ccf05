//! Source registry
//!
//! Maps source ids to their configuration, fetcher and enrichment chain. The
//! fetcher kind decides the publish side: range and cursor sources go to the
//! event sink, snapshot sources replace a collection.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{Config, Continuation, SourceConfig};
use crate::enrich::EnrichmentChain;
use crate::error::{Error, Result};
use crate::fetch::{CursorFetcher, RangeFetcher, SnapshotFetcher};
use crate::types::SourceId;

/// How a source is fetched
#[derive(Clone)]
pub enum Fetcher {
    /// Queried by time window
    Range(Arc<dyn RangeFetcher>),
    /// Queried by numeric id cursor
    Cursor(Arc<dyn CursorFetcher>),
    /// Full replace-all snapshot
    Snapshot(Arc<dyn SnapshotFetcher>),
}

impl Fetcher {
    /// Short name used in logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Fetcher::Range(_) => "range",
            Fetcher::Cursor(_) => "cursor",
            Fetcher::Snapshot(_) => "snapshot",
        }
    }
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fetcher::{}", self.kind())
    }
}

/// Everything the engine needs to run one source
#[derive(Clone, Debug)]
pub struct RegisteredSource {
    /// Source configuration
    pub config: SourceConfig,
    /// Vendor adapter
    pub fetcher: Fetcher,
    /// Steps applied to every fetched event
    pub enrichment: EnrichmentChain,
}

/// Registered sources, keyed by id
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<SourceId, RegisteredSource>,
}

impl SourceRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source without enrichment
    pub fn register(&mut self, config: SourceConfig, fetcher: Fetcher) -> Result<()> {
        self.register_with(config, fetcher, EnrichmentChain::new())
    }

    /// Register a source with an enrichment chain
    pub fn register_with(
        &mut self,
        config: SourceConfig,
        fetcher: Fetcher,
        enrichment: EnrichmentChain,
    ) -> Result<()> {
        if self.sources.contains_key(&config.id) {
            return Err(Error::config(
                format!("source {} is already registered", config.id),
                "sources",
            ));
        }
        if let Some(other) = self
            .sources
            .values()
            .find(|s| s.config.store_key == config.store_key)
        {
            return Err(Error::config(
                format!(
                    "store key {} is already used by source {}",
                    config.store_key, other.config.id
                ),
                "sources",
            ));
        }
        if config.continuation == Continuation::Windowed && config.time_field.is_none() {
            return Err(Error::config(
                format!("windowed source {} needs a time_field", config.id),
                "time_field",
            ));
        }
        if matches!(fetcher, Fetcher::Snapshot(_)) && config.collection.is_none() {
            return Err(Error::config(
                format!("snapshot source {} needs a collection", config.id),
                "collection",
            ));
        }

        tracing::debug!(
            source = %config.id,
            kind = fetcher.kind(),
            enrichment = ?enrichment.names(),
            "Registered source"
        );
        self.sources.insert(
            config.id.clone(),
            RegisteredSource {
                config,
                fetcher,
                enrichment,
            },
        );
        Ok(())
    }

    /// Register the source `id` using its entry in `config`
    pub fn register_configured(
        &mut self,
        config: &Config,
        id: &str,
        fetcher: Fetcher,
        enrichment: EnrichmentChain,
    ) -> Result<()> {
        let source = config
            .source(&SourceId::new(id))
            .ok_or_else(|| Error::UnknownSource(id.to_string()))?;
        self.register_with(source.clone(), fetcher, enrichment)
    }

    /// Look up a source
    pub fn get(&self, id: &SourceId) -> Result<&RegisteredSource> {
        self.sources
            .get(id)
            .ok_or_else(|| Error::UnknownSource(id.to_string()))
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<SourceId> {
        self.sources.keys().cloned().collect()
    }

    /// Iterate over registered sources in id order
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredSource> {
        self.sources.values()
    }

    /// Number of registered sources
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether no sources are registered
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
