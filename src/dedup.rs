//! Delivered-event suppression
//!
//! [`Deduplicator::filter_new`] is a pure read and may be called any number of
//! times; only [`Deduplicator::mark_seen`] writes, and the engine calls it
//! after the checkpoint has been appended.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::store::DedupStore;
use crate::types::{Event, IdSpec, StoreKey};

/// Filters already-delivered events out of a fetch result
pub struct Deduplicator {
    store: Arc<dyn DedupStore>,
}

impl Deduplicator {
    /// Create a deduplicator over `store`
    pub fn new(store: Arc<dyn DedupStore>) -> Self {
        Self { store }
    }

    /// Keep the events whose id has not been recorded for `key`, in input order
    ///
    /// Events without an identifier cannot be suppressed and are always kept.
    pub async fn filter_new(
        &self,
        events: Vec<Event>,
        id_spec: &IdSpec,
        key: &StoreKey,
    ) -> Result<Vec<Event>> {
        self.store.ensure_dedup(key).await?;

        let ids: Vec<Option<String>> = events.iter().map(|e| id_spec.id_of(e)).collect();

        let mut seen_candidates = HashSet::new();
        let candidates: Vec<String> = ids
            .iter()
            .flatten()
            .filter(|id| seen_candidates.insert(id.as_str()))
            .cloned()
            .collect();

        let unidentified = ids.iter().filter(|id| id.is_none()).count();
        if unidentified > 0 {
            tracing::warn!(
                store_key = %key,
                count = unidentified,
                "Events without an identifier pass through dedup"
            );
        }

        if candidates.is_empty() {
            return Ok(events);
        }

        let existing = self.store.existing_ids(key, &candidates).await?;

        let before = events.len();
        let fresh: Vec<Event> = events
            .into_iter()
            .zip(ids)
            .filter(|(_, id)| id.as_ref().is_none_or(|id| !existing.contains(id)))
            .map(|(event, _)| event)
            .collect();

        tracing::debug!(
            store_key = %key,
            fetched = before,
            new = fresh.len(),
            suppressed = before - fresh.len(),
            "Filtered delivered events"
        );

        Ok(fresh)
    }

    /// Record the ids of `events` as delivered
    ///
    /// Empty input performs no store call.
    pub async fn mark_seen(
        &self,
        events: &[Event],
        id_spec: &IdSpec,
        key: &StoreKey,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut unique = HashSet::new();
        let ids: Vec<String> = events
            .iter()
            .filter_map(|e| id_spec.id_of(e))
            .filter(|id| unique.insert(id.clone()))
            .collect();

        if ids.is_empty() {
            return Ok(0);
        }

        self.store.append_ids(key, &ids, now).await?;
        tracing::debug!(store_key = %key, recorded = ids.len(), "Recorded delivered ids");
        Ok(ids.len())
    }
}
