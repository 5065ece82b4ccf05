//! Event collector envelopes
//!
//! Each event is wrapped as `{"event": <body>, "time": <epoch seconds>,
//! "sourcetype": <category>}`; metadata keys are only present when the
//! configured field exists on the event. A request body is the plain
//! concatenation of the envelopes.

use serde_json::{Map, Number, Value};

use crate::config::SourceConfig;
use crate::error::Result;
use crate::types::{EPOCH_MILLIS_THRESHOLD, Event, timestamp_of};

/// Which event fields become envelope metadata
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvelopeOptions {
    /// Field copied into `time`
    pub time_field: Option<String>,
    /// Field moved out of the body into `sourcetype`
    pub category_field: Option<String>,
}

impl EnvelopeOptions {
    /// Options configured for a source
    pub fn for_source(source: &SourceConfig) -> Self {
        Self {
            time_field: source.time_field.clone(),
            category_field: source.category_field.clone(),
        }
    }
}

/// Wrap one event
pub fn envelope(event: &Event, options: &EnvelopeOptions) -> Value {
    let (body, category) = match &options.category_field {
        Some(field) => event.without_field(field),
        None => (event.clone(), None),
    };

    let time = options
        .time_field
        .as_deref()
        .and_then(|field| body.get(field))
        .and_then(|raw| {
            let normalized = normalize_time(raw);
            if normalized.is_none() {
                tracing::debug!(value = %raw, "Dropping unparseable event time from envelope");
            }
            normalized
        });

    let mut wrapped = Map::new();
    wrapped.insert("event".to_string(), body.into_value());
    if let Some(time) = time {
        wrapped.insert("time".to_string(), time);
    }
    if let Some(category) = category {
        wrapped.insert("sourcetype".to_string(), category);
    }
    Value::Object(wrapped)
}

/// Serialize a batch of events into one request body
pub fn encode_batch(events: &[Event], options: &EnvelopeOptions) -> Result<String> {
    let mut body = String::new();
    for event in events {
        body.push_str(&serde_json::to_string(&envelope(event, options))?);
    }
    Ok(body)
}

/// Convert a vendor timestamp into epoch seconds with millisecond precision
///
/// Numbers already in epoch seconds are passed through; millisecond numbers,
/// numeric strings and RFC 3339 strings are converted.
pub fn normalize_time(raw: &Value) -> Option<Value> {
    if let Value::Number(n) = raw
        && n.as_f64().is_some_and(|v| v <= EPOCH_MILLIS_THRESHOLD)
    {
        return Some(raw.clone());
    }
    timestamp_of(raw).and_then(|dt| seconds(dt.timestamp_millis() as f64 / 1000.0))
}

fn seconds(value: f64) -> Option<Value> {
    let rounded = (value * 1000.0).round() / 1000.0;
    Number::from_f64(rounded).map(Value::Number)
}
