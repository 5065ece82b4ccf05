//! Source fetcher contracts
//!
//! Vendor adapters implement one of [`RangeFetcher`], [`CursorFetcher`] or
//! [`SnapshotFetcher`]. Authentication, request shaping and response parsing
//! live entirely in the adapter; the engine only sees [`FetchOutput`].
//!
//! A page request that fails mid-pagination does not lose the pages already
//! collected: the adapter returns them with `complete == false` and the
//! source's [`PartialPagePolicy`] decides whether the run continues.

use async_trait::async_trait;
use std::future::Future;

use crate::config::PartialPagePolicy;
use crate::error::{FetchError, Result};
use crate::types::{Event, FetchWindow, SourceId};

/// Events returned by one fetch
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchOutput {
    /// Events in vendor order
    pub events: Vec<Event>,
    /// False when pagination stopped on a failed page
    pub complete: bool,
}

impl FetchOutput {
    /// A fully paginated result
    pub fn complete(events: Vec<Event>) -> Self {
        Self {
            events,
            complete: true,
        }
    }

    /// A result truncated by a failed page
    pub fn partial(events: Vec<Event>) -> Self {
        Self {
            events,
            complete: false,
        }
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no events were returned
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Fetch result of a cursor source
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CursorOutput {
    /// Events newer than the requested cursor, oldest first
    pub output: FetchOutput,
    /// Highest id observed, never below the requested cursor
    pub max_id: i64,
}

/// Source queried by time interval
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    /// All events with a timestamp in `window`
    async fn fetch_range(&self, window: &FetchWindow) -> Result<FetchOutput>;
}

/// Source queried by a monotonically increasing numeric id
#[async_trait]
pub trait CursorFetcher: Send + Sync {
    /// All events with an id greater than `after_id`
    async fn fetch_since(&self, after_id: i64) -> Result<CursorOutput>;
}

/// Source whose full state is replaced on every run
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    /// The complete current record set
    async fn fetch_all(&self) -> Result<FetchOutput>;
}

/// One page of a paginated vendor response
#[derive(Clone, Debug, PartialEq)]
pub enum Page<C> {
    /// A page of events and the cursor of the next page, if any
    Items {
        /// Events on this page
        events: Vec<Event>,
        /// Cursor for the next page; `None` ends pagination
        next: Option<C>,
    },
    /// The vendor answered this page with a non-success status
    Failed {
        /// HTTP status of the failed page
        status: u16,
    },
}

/// Collect pages in order, starting from `first`
///
/// Stops when a page has no next cursor (complete) or when a page fails
/// (partial, keeping everything collected so far). Errors returned by
/// `fetch_page` itself abort the fetch.
pub async fn paginate<C, F, Fut>(first: C, mut fetch_page: F) -> Result<FetchOutput>
where
    F: FnMut(C) -> Fut,
    Fut: Future<Output = Result<Page<C>>>,
{
    let mut collected = Vec::new();
    let mut cursor = first;
    let mut pages = 0usize;

    loop {
        match fetch_page(cursor).await? {
            Page::Items { events, next } => {
                pages += 1;
                collected.extend(events);
                match next {
                    Some(next) => cursor = next,
                    None => {
                        tracing::debug!(pages, events = collected.len(), "Pagination complete");
                        return Ok(FetchOutput::complete(collected));
                    }
                }
            }
            Page::Failed { status } => {
                tracing::warn!(
                    status,
                    pages,
                    events = collected.len(),
                    "Page request failed, returning partial result"
                );
                return Ok(FetchOutput::partial(collected));
            }
        }
    }
}

/// Decide whether a truncated fetch may continue to delivery
pub fn apply_partial_policy(
    source: &SourceId,
    output: FetchOutput,
    policy: PartialPagePolicy,
) -> Result<FetchOutput> {
    if output.complete {
        return Ok(output);
    }

    match policy {
        PartialPagePolicy::Accept => {
            tracing::warn!(
                source = %source,
                collected = output.len(),
                "Continuing with partial fetch result"
            );
            Ok(output)
        }
        PartialPagePolicy::Fail => Err(FetchError::Partial {
            source_id: source.to_string(),
            collected: output.len(),
        }
        .into()),
    }
}
