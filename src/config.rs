//! Configuration types for audit-sync
//!
//! A [`Config`] is built once at process start (usually from a JSON file via
//! [`Config::load`]) and handed to [`SyncContext`](crate::engine::SyncContext).
//! Nothing in the crate reads configuration from globals or the environment.

use crate::error::{Error, Result};
use crate::types::{IdSpec, SourceId, StoreKey};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Checkpoint/dedup store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Sink delivery settings
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Per-source settings
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Parse a configuration from JSON text and validate it
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| Error::Config {
            message: format!("failed to read {}: {}", path.display(), e),
            key: None,
        })?;
        Self::from_json(&text)
    }

    /// Look up the configuration of one source
    pub fn source(&self, id: &SourceId) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| &s.id == id)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.delivery.hec_url)
            .map_err(|e| Error::config(format!("invalid URL: {}", e), "delivery.hec_url"))?;
        url::Url::parse(&self.delivery.collections_url).map_err(|e| {
            Error::config(format!("invalid URL: {}", e), "delivery.collections_url")
        })?;

        if self.delivery.retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "backoff multiplier must be at least 1.0",
                "delivery.retry.backoff_multiplier",
            ));
        }

        let mut ids = HashSet::new();
        let mut keys = HashSet::new();
        for (i, source) in self.sources.iter().enumerate() {
            if source.id.as_str().is_empty() {
                return Err(Error::config("source id must not be empty", format!("sources[{}].id", i)));
            }
            if !ids.insert(&source.id) {
                return Err(Error::config(
                    format!("duplicate source id {}", source.id),
                    format!("sources[{}].id", i),
                ));
            }
            if !keys.insert(&source.store_key) {
                return Err(Error::config(
                    format!("store key {} is shared by two sources", source.store_key),
                    format!("sources[{}].store_key", i),
                ));
            }
            if source.batch_size == 0 {
                return Err(Error::config(
                    "batch size must be positive",
                    format!("sources[{}].batch_size", i),
                ));
            }
            if source.continuation == Continuation::Windowed && source.time_field.is_none() {
                return Err(Error::config(
                    "a windowed source needs a time_field to advance its window",
                    format!("sources[{}].time_field", i),
                ));
            }
            if source.collection.is_some() && source.collection_token.is_none() {
                return Err(Error::config(
                    "a collection requires a collection_token",
                    format!("sources[{}].collection_token", i),
                ));
            }
        }
        Ok(())
    }
}

/// Checkpoint/dedup store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path (default: "./audit-sync.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Sink delivery configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// HTTP Event Collector endpoint that accepts batches of event envelopes
    #[serde(default = "default_hec_url")]
    pub hec_url: String,

    /// Base URL of the collection REST API (key-value store)
    #[serde(default = "default_collections_url")]
    pub collections_url: String,

    /// Per-request timeout (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Skip TLS certificate verification (default: false)
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Retry policy for transient sink failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Sink statuses treated as transient (default: 500, 502, 503, 504)
    #[serde(default = "default_retry_statuses")]
    pub retry_statuses: Vec<u16>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            hec_url: default_hec_url(),
            collections_url: default_collections_url(),
            timeout: default_request_timeout(),
            accept_invalid_certs: false,
            retry: RetryConfig::default(),
            retry_statuses: default_retry_statuses(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 100 ms)
    #[serde(default = "default_initial_delay", with = "duration_ms_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 10 seconds)
    #[serde(default = "default_max_delay", with = "duration_ms_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// How a persisted continuation advances
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Continuation {
    /// Next window starts at the previous end and spans one unit delta
    #[default]
    Simple,
    /// Window is re-fetched until events are observed; start advances to last event + 1 ms
    Windowed,
}

/// What to do when pagination stops on a failed page
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialPagePolicy {
    /// Keep the events collected so far and finish the run (logged as a warning)
    #[default]
    Accept,
    /// Abort the run before delivery
    Fail,
}

/// How a windowed checkpoint's end moves when a run observes no events
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyWindow {
    /// Keep the end where it was; the next run re-fetches the identical window
    Hold,
    /// Move the end up to the time of the run so later events are picked up
    #[default]
    Extend,
}

/// Per-source configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source identifier used to look up the registered fetcher
    pub id: SourceId,

    /// Prefix for this source's checkpoint and dedup tables
    pub store_key: StoreKey,

    /// Event collector token for this source
    #[serde(default)]
    pub hec_token: String,

    /// Target collection for snapshot sources
    #[serde(default)]
    pub collection: Option<String>,

    /// Bearer token for the collection REST API
    #[serde(default)]
    pub collection_token: Option<String>,

    /// Events per delivery request (default: 50)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Field carrying the event time, attached as delivery metadata
    #[serde(default)]
    pub time_field: Option<String>,

    /// Field moved out of the event body into the sink's category metadata
    #[serde(default)]
    pub category_field: Option<String>,

    /// Identifier used to suppress already-delivered events (None = no dedup)
    #[serde(default)]
    pub dedup_id: Option<IdSpec>,

    /// Continuation style for range sources
    #[serde(default)]
    pub continuation: Continuation,

    /// Handling of truncated pagination
    #[serde(default)]
    pub partial_pages: PartialPagePolicy,

    /// Windowed checkpoint behavior on runs without events
    #[serde(default)]
    pub empty_window: EmptyWindow,

    /// Cursor used for the first persisted run of a cursor source (default: 0)
    #[serde(default)]
    pub initial_cursor: i64,

    /// Polling interval for the scheduler (None = only run on demand)
    #[serde(default, with = "optional_duration_serde")]
    pub interval: Option<Duration>,
}

impl SourceConfig {
    /// A source with default settings
    pub fn new(id: impl Into<String>, store_key: StoreKey) -> Self {
        Self {
            id: SourceId::new(id),
            store_key,
            hec_token: String::new(),
            collection: None,
            collection_token: None,
            batch_size: default_batch_size(),
            time_field: None,
            category_field: None,
            dedup_id: None,
            continuation: Continuation::default(),
            partial_pages: PartialPagePolicy::default(),
            empty_window: EmptyWindow::default(),
            initial_cursor: 0,
            interval: None,
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./audit-sync.db")
}

fn default_hec_url() -> String {
    "https://localhost:8088/services/collector/event".to_string()
}

fn default_collections_url() -> String {
    "https://localhost:8089/servicesNS/nobody/search/".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_statuses() -> Vec<u16> {
    vec![500, 502, 503, 504]
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_batch_size() -> usize {
    50
}

fn default_true() -> bool {
    true
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds), used for retry delays
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
