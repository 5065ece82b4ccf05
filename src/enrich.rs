//! Per-source event enrichment
//!
//! An [`EnrichmentChain`] is an ordered list of named, pure `Event -> Event`
//! steps. Every step returns a new event; the input is never modified.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::types::Event;

type StepFn = dyn Fn(Event) -> Event + Send + Sync;

/// A named transformation step
#[derive(Clone)]
pub struct Enrichment {
    name: String,
    step: Arc<StepFn>,
}

impl Enrichment {
    /// Wrap a closure as a named step
    pub fn new<F>(name: impl Into<String>, step: F) -> Self
    where
        F: Fn(Event) -> Event + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            step: Arc::new(step),
        }
    }

    /// Name of the step, as recorded in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the step on one event
    pub fn apply(&self, event: Event) -> Event {
        (self.step)(event)
    }
}

impl fmt::Debug for Enrichment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enrichment").field("name", &self.name).finish()
    }
}

/// Ordered composition of enrichment steps
#[derive(Clone, Debug, Default)]
pub struct EnrichmentChain {
    steps: Vec<Enrichment>,
}

impl EnrichmentChain {
    /// An empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step
    #[must_use]
    pub fn with(mut self, step: Enrichment) -> Self {
        self.steps.push(step);
        self
    }

    /// Names of the steps, in application order
    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(Enrichment::name).collect()
    }

    /// Whether the chain has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step on one event
    pub fn apply(&self, event: Event) -> Event {
        self.steps.iter().fold(event, |event, step| step.apply(event))
    }

    /// Run every step on every event, preserving order
    pub fn apply_all(&self, events: Vec<Event>) -> Vec<Event> {
        if self.steps.is_empty() {
            return events;
        }
        events.into_iter().map(|e| self.apply(e)).collect()
    }
}

/// Set `field` to a constant value (e.g. a per-source category override)
pub fn set_field(field: impl Into<String>, value: Value) -> Enrichment {
    let field = field.into();
    Enrichment::new(format!("set_field:{}", field), move |event| {
        event.with_field(field.clone(), value.clone())
    })
}

/// Move the value of `from` to `to`; events without `from` are unchanged
pub fn rename_field(from: impl Into<String>, to: impl Into<String>) -> Enrichment {
    let from = from.into();
    let to = to.into();
    Enrichment::new(format!("rename_field:{}->{}", from, to), move |event| {
        match event.without_field(&from) {
            (stripped, Some(value)) => stripped.with_field(to.clone(), value),
            (_, None) => event,
        }
    })
}

/// Parse the timestamp in `from` and write it to `to` as epoch milliseconds
///
/// With `format == None` the value must be RFC 3339; otherwise it is parsed
/// with the given chrono format and taken as UTC. Values that do not parse
/// leave the event unchanged.
pub fn timestamp_millis(
    from: impl Into<String>,
    to: impl Into<String>,
    format: Option<String>,
) -> Enrichment {
    let from = from.into();
    let to = to.into();
    Enrichment::new(format!("timestamp_millis:{}->{}", from, to), move |event| {
        let parsed = event
            .get(&from)
            .and_then(Value::as_str)
            .and_then(|raw| parse_timestamp(raw, format.as_deref()));

        match parsed {
            Some(ts) => event.with_field(to.clone(), Value::from(ts.timestamp_millis())),
            None => {
                tracing::debug!(field = %from, "Timestamp field missing or unparseable");
                event
            }
        }
    })
}

fn parse_timestamp(raw: &str, format: Option<&str>) -> Option<DateTime<Utc>> {
    match format {
        None => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Some(format) => NaiveDateTime::parse_from_str(raw, format)
            .ok()
            .map(|naive| naive.and_utc()),
    }
}
