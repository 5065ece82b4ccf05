//! Checkpoint writing
//!
//! Only the success path of a run reaches the writer, after every batch has
//! been delivered. Each commit appends exactly one row.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::EmptyWindow;
use crate::error::{Error, Result};
use crate::store::CheckpointStore;
use crate::types::{CursorCheckpoint, Event, FetchWindow, RangeCheckpoint, StoreKey, timestamp_of};

/// A checkpoint appended by a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommittedCheckpoint {
    /// Row appended to the range/windowed log
    Range(RangeCheckpoint),
    /// Row appended to the cursor log
    Cursor(CursorCheckpoint),
}

/// Next windowed checkpoint after fetching `window`
///
/// - no events: the window is kept and flagged unsuccessful; its end stays put
///   under [`EmptyWindow::Hold`] and moves up to `now` under
///   [`EmptyWindow::Extend`]
/// - events with latest time `M`: the window becomes `[M + 1ms, max(now, M + 2ms))`
/// - events without any readable time: the start is kept and the run counts
///   as successful
///
/// An event time at the very end of the representable range is an error.
pub fn windowed_checkpoint(
    window: &FetchWindow,
    event_count: usize,
    latest_event: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    empty: EmptyWindow,
) -> Result<RangeCheckpoint> {
    if event_count == 0 {
        let end = match empty {
            EmptyWindow::Hold => window.end,
            EmptyWindow::Extend => window.end.max(now),
        };
        return Ok(RangeCheckpoint {
            start: window.start,
            end,
            success: false,
            recorded_at: now,
        });
    }

    let Some(latest) = latest_event else {
        return Ok(RangeCheckpoint {
            start: window.start,
            end: window.end.max(now),
            success: true,
            recorded_at: now,
        });
    };

    let after = |ms: i64| {
        latest
            .checked_add_signed(Duration::milliseconds(ms))
            .ok_or_else(|| Error::Other(format!("event time {latest} out of range")))
    };
    Ok(RangeCheckpoint {
        start: after(1)?,
        end: now.max(after(2)?),
        success: true,
        recorded_at: now,
    })
}

/// Latest readable event time in `field`
pub fn latest_event_time(events: &[Event], field: &str) -> Option<DateTime<Utc>> {
    events
        .iter()
        .filter_map(|e| e.get(field).and_then(timestamp_of))
        .max()
}

/// Appends checkpoints stamped with the current time
pub struct CheckpointWriter {
    store: Arc<dyn CheckpointStore>,
    clock: Arc<dyn Clock>,
}

impl CheckpointWriter {
    /// Create a writer
    pub fn new(store: Arc<dyn CheckpointStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a completed simple-continuation window
    pub async fn commit_simple(&self, key: &StoreKey, window: &FetchWindow) -> Result<RangeCheckpoint> {
        let checkpoint = RangeCheckpoint {
            start: window.start,
            end: window.end,
            success: true,
            recorded_at: self.clock.now(),
        };
        self.store.append_range(key, &checkpoint).await?;

        tracing::info!(store_key = %key, window = %window, "Checkpoint written");
        Ok(checkpoint)
    }

    /// Record the outcome of a windowed run
    ///
    /// `time_field` names the event field holding the event time; without it
    /// the start of the window cannot move.
    pub async fn commit_windowed(
        &self,
        key: &StoreKey,
        window: &FetchWindow,
        events: &[Event],
        time_field: Option<&str>,
        empty: EmptyWindow,
    ) -> Result<RangeCheckpoint> {
        let latest = time_field.and_then(|field| latest_event_time(events, field));
        if !events.is_empty() && latest.is_none() {
            tracing::warn!(
                store_key = %key,
                events = events.len(),
                "No readable event time, windowed start not advanced"
            );
        }

        let checkpoint =
            windowed_checkpoint(window, events.len(), latest, self.clock.now(), empty)?;
        self.store.append_range(key, &checkpoint).await?;

        tracing::info!(
            store_key = %key,
            start = %checkpoint.start,
            end = %checkpoint.end,
            success = checkpoint.success,
            "Windowed checkpoint written"
        );
        Ok(checkpoint)
    }

    /// Record a cursor run; the stored cursor never moves backwards
    pub async fn commit_cursor(
        &self,
        key: &StoreKey,
        previous: i64,
        max_id: i64,
        fetched: usize,
    ) -> Result<CursorCheckpoint> {
        let checkpoint = CursorCheckpoint {
            last_id: previous.max(max_id),
            fetched_count: i64::try_from(fetched).unwrap_or(i64::MAX),
            recorded_at: self.clock.now(),
        };
        self.store.append_cursor(key, &checkpoint).await?;

        tracing::info!(
            store_key = %key,
            last_id = checkpoint.last_id,
            fetched,
            "Cursor checkpoint written"
        );
        Ok(checkpoint)
    }
}
