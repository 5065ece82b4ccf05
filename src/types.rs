//! Core types for audit-sync

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Identifier of a registered source (e.g. "jira", "workspace_login")
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub String);

impl SourceId {
    /// Create a new SourceId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SourceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maximum length of a store key
const MAX_STORE_KEY_LEN: usize = 48;

/// Validated prefix for a source's checkpoint and dedup tables
///
/// Table names are the only place where a value is spliced into SQL text,
/// so the key is restricted to `[a-z0-9_]`, starts with a letter and is at
/// most 48 characters long.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoreKey(String);

impl StoreKey {
    /// Validate and wrap a store key
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let valid_chars = key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        let starts_with_letter = key.chars().next().is_some_and(|c| c.is_ascii_lowercase());

        if key.is_empty() || key.len() > MAX_STORE_KEY_LEN || !valid_chars || !starts_with_letter {
            return Err(Error::InvalidStoreKey(key));
        }
        Ok(Self(key))
    }

    /// The raw key
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Table holding range/windowed checkpoints
    pub fn fetch_table(&self) -> String {
        format!("{}_log_fetch", self.0)
    }

    /// Table holding cursor checkpoints
    pub fn cursor_table(&self) -> String {
        format!("{}_cursor_fetch", self.0)
    }

    /// Table holding delivered event ids
    pub fn dedup_table(&self) -> String {
        format!("{}_log_dedup", self.0)
    }
}

impl TryFrom<String> for StoreKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<StoreKey> for String {
    fn from(key: StoreKey) -> Self {
        key.0
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An audit event as returned by a vendor API
///
/// Events are immutable: every transformation returns a new value. The payload
/// is always a JSON object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Map<String, Value>);

impl Event {
    /// Build an event from a JSON value, rejecting anything but an object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::Other(format!(
                "event payload must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Build an event from an already-validated object
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Look up a top-level field
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// All fields of the event
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Return a copy of this event with `field` set to `value`
    #[must_use]
    pub fn with_field(&self, field: impl Into<String>, value: Value) -> Self {
        let mut map = self.0.clone();
        map.insert(field.into(), value);
        Self(map)
    }

    /// Return a copy of this event without `field`, plus the removed value
    #[must_use]
    pub fn without_field(&self, field: &str) -> (Self, Option<Value>) {
        let mut map = self.0.clone();
        let removed = map.remove(field);
        (Self(map), removed)
    }

    /// Consume the event into its JSON representation
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// How to derive the stable identifier of an event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdSpec {
    /// A single vendor-defined key
    Field(String),
    /// Several fields joined with a separator
    Composite {
        /// Fields to join, in order
        fields: Vec<String>,
        /// Separator placed between field values
        #[serde(default = "default_id_separator")]
        separator: String,
    },
}

fn default_id_separator() -> String {
    ":".to_string()
}

impl IdSpec {
    /// Extract the identifier of `event`, or `None` when a field is missing
    pub fn id_of(&self, event: &Event) -> Option<String> {
        match self {
            IdSpec::Field(field) => event.get(field).and_then(render_id_part),
            IdSpec::Composite { fields, separator } => {
                let parts: Option<Vec<String>> = fields
                    .iter()
                    .map(|f| event.get(f).and_then(render_id_part))
                    .collect();
                parts.map(|p| p.join(separator))
            }
        }
    }
}

fn render_id_part(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Unit used by lookback and continuation windows
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    /// Minutes; continuation advances 5 minutes per run
    Minutes,
    /// Days; continuation advances 24 hours per run
    Days,
}

impl TimeUnit {
    /// Span of `n` units
    pub fn span(&self, n: u32) -> Duration {
        match self {
            TimeUnit::Minutes => Duration::minutes(i64::from(n)),
            TimeUnit::Days => Duration::hours(24 * i64::from(n)),
        }
    }

    /// How far a persisted continuation advances per run
    pub fn continuation_delta(&self) -> Duration {
        match self {
            TimeUnit::Minutes => Duration::minutes(5),
            TimeUnit::Days => Duration::hours(24),
        }
    }
}

impl std::str::FromStr for TimeUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "minutes" => Ok(TimeUnit::Minutes),
            "days" => Ok(TimeUnit::Days),
            other => Err(Error::Config {
                message: format!("unknown time unit {:?} (expected minutes or days)", other),
                key: Some("unit".to_string()),
            }),
        }
    }
}

/// Half-open fetch interval `[start, end)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    /// Build a window, enforcing `start < end`
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(Error::Other(format!(
                "empty fetch window: start {} is not before end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Width of the window
    pub fn width(&self) -> Duration {
        self.end - self.start
    }
}

impl std::fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// One row of the range/windowed checkpoint log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeCheckpoint {
    /// Window start
    pub start: DateTime<Utc>,
    /// Window end
    pub end: DateTime<Utc>,
    /// Whether the run found and delivered events (windowed) or completed (simple)
    pub success: bool,
    /// When the row was appended
    pub recorded_at: DateTime<Utc>,
}

impl RangeCheckpoint {
    /// The stored interval as a window
    pub fn window(&self) -> Result<FetchWindow> {
        FetchWindow::new(self.start, self.end)
    }
}

/// One row of the cursor checkpoint log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorCheckpoint {
    /// Highest vendor id delivered so far
    pub last_id: i64,
    /// Number of events fetched by the run that wrote this row
    pub fetched_count: i64,
    /// When the row was appended
    pub recorded_at: DateTime<Utc>,
}

/// A persisted delivered-event identifier
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    /// Event identifier
    pub id: String,
    /// When the id was recorded
    pub recorded_at: DateTime<Utc>,
}

/// Numeric timestamps above this are taken to be epoch milliseconds
pub(crate) const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

/// Read a vendor timestamp
///
/// Numbers and numeric strings above 1e11 are epoch milliseconds, smaller
/// ones epoch seconds (fractions allowed); other strings must be RFC 3339.
pub fn timestamp_of(value: &Value) -> Option<DateTime<Utc>> {
    let numeric = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(v) => Some(v),
            Err(_) => {
                return DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc));
            }
        },
        _ => None,
    }?;

    if !numeric.is_finite() {
        return None;
    }
    let millis = if numeric > EPOCH_MILLIS_THRESHOLD {
        numeric
    } else {
        numeric * 1000.0
    };
    DateTime::<Utc>::from_timestamp_millis(millis.round() as i64)
}

/// Convert a millisecond timestamp from the store into a UTC datetime
pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Other(format!("timestamp out of range: {} ms", ms)))
}
