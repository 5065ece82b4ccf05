//! Window calculation
//!
//! Decides which time interval a run fetches. The functions here are pure in
//! `(now, unit, checkpoint)`; [`WindowCalculator`] binds them to a clock and a
//! checkpoint store.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::store::CheckpointStore;
use crate::types::{FetchWindow, RangeCheckpoint, StoreKey, TimeUnit};

/// Lookback used by a persisted source that has never run
pub const FIRST_RUN_LOOKBACK_MINUTES: u32 = 5;

/// `[now - n * unit, now)`
pub fn fixed_lookback(now: DateTime<Utc>, n: u32, unit: TimeUnit) -> Result<FetchWindow> {
    if n == 0 {
        return Err(Error::config("lookback must be at least 1", "n"));
    }
    let start = now
        .checked_sub_signed(unit.span(n))
        .ok_or_else(|| Error::config(format!("lookback of {n} {unit:?} out of range"), "n"))?;
    FetchWindow::new(start, now)
}

fn first_run(now: DateTime<Utc>) -> Result<FetchWindow> {
    fixed_lookback(now, FIRST_RUN_LOOKBACK_MINUTES, TimeUnit::Minutes)
}

fn guard_future(window: FetchWindow, now: DateTime<Utc>) -> Result<FetchWindow> {
    if window.start > now {
        return Err(Error::FutureWindow {
            start: window.start,
            end: window.end,
            now,
        });
    }
    Ok(window)
}

/// Next window of a simple continuation
///
/// Starts where the previous window ended and spans one continuation delta of
/// `unit`. A schedule that has run ahead of the clock is rejected before any
/// fetch.
pub fn continue_simple(
    now: DateTime<Utc>,
    unit: TimeUnit,
    latest: Option<&RangeCheckpoint>,
) -> Result<FetchWindow> {
    let Some(previous) = latest else {
        return first_run(now);
    };

    let start = previous.end;
    let end = start
        .checked_add_signed(unit.continuation_delta())
        .ok_or_else(|| Error::Other(format!("stored window end {start} out of range")))?;
    guard_future(FetchWindow { start, end }, now)
}

/// Next window of a windowed continuation
///
/// The stored interval is re-fetched as-is; the checkpoint writer is what
/// moves it forward once events have been seen. Its start comes from vendor
/// event times, so a start slightly past `now` (vendor clock ahead of ours) is
/// fetched anyway and only logged.
pub fn continue_windowed(
    now: DateTime<Utc>,
    latest: Option<&RangeCheckpoint>,
) -> Result<FetchWindow> {
    let Some(previous) = latest else {
        return first_run(now);
    };
    let window = previous.window()?;
    if window.start > now {
        tracing::warn!(
            window = %window,
            now = %now,
            "Windowed checkpoint starts after the local clock, fetching anyway"
        );
    }
    Ok(window)
}

/// How a run picks its window
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowMode {
    /// Ad hoc `[now - n * unit, now)`; never read or written to the store
    Lookback {
        /// Number of units to look back
        n: u32,
        /// Unit of the lookback
        unit: TimeUnit,
    },
    /// Persisted simple continuation
    Simple {
        /// Unit deciding the continuation delta
        unit: TimeUnit,
    },
    /// Persisted windowed continuation
    Windowed,
}

/// A computed window plus what it was derived from
#[derive(Clone, Debug, PartialEq)]
pub struct WindowPlan {
    /// Interval to fetch
    pub window: FetchWindow,
    /// Whether the run should write a checkpoint on success
    pub persisted: bool,
    /// Checkpoint the window was derived from
    pub previous: Option<RangeCheckpoint>,
    /// Clock reading used for the computation
    pub computed_at: DateTime<Utc>,
}

/// Computes fetch windows against a clock and a checkpoint store
pub struct WindowCalculator {
    clock: Arc<dyn Clock>,
    store: Arc<dyn CheckpointStore>,
}

impl WindowCalculator {
    /// Create a calculator
    pub fn new(clock: Arc<dyn Clock>, store: Arc<dyn CheckpointStore>) -> Self {
        Self { clock, store }
    }

    /// Compute the window for the next run of `key`
    pub async fn plan(&self, key: &StoreKey, mode: WindowMode) -> Result<WindowPlan> {
        let now = self.clock.now();

        let (window, persisted, previous) = match mode {
            WindowMode::Lookback { n, unit } => (fixed_lookback(now, n, unit)?, false, None),
            WindowMode::Simple { unit } => {
                let previous = self.store.latest_range(key).await?;
                (continue_simple(now, unit, previous.as_ref())?, true, previous)
            }
            WindowMode::Windowed => {
                let previous = self.store.latest_range(key).await?;
                (continue_windowed(now, previous.as_ref())?, true, previous)
            }
        };

        tracing::debug!(
            store_key = %key,
            window = %window,
            persisted,
            lag_secs = (now - window.end).max(Duration::zero()).num_seconds(),
            "Computed fetch window"
        );

        Ok(WindowPlan {
            window,
            persisted,
            previous,
            computed_at: now,
        })
    }
}
