//! Cursor-based fetching for sources that expose monotonically increasing ids
//!
//! Vendors of this kind return pages newest-first. Paging continues until an
//! already-known id shows up or the vendor reports no further pages; the
//! collected events are then handed on oldest-first.

use std::future::Future;

use crate::error::Result;
use crate::fetch::{CursorOutput, FetchOutput, Page};
use crate::types::Event;

/// Result of scanning one newest-first page against the known cursor
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PageScan {
    /// Entries newer than the cursor, in page order
    pub fresh: Vec<Event>,
    /// Whether an id at or below the cursor was encountered
    pub reached_known: bool,
    /// Highest id among the fresh entries
    pub max_id: Option<i64>,
}

/// Scan a newest-first page, dropping the first known id and everything after it
///
/// Entries without a readable id are kept; they never move the cursor.
pub fn scan_page<F>(entries: Vec<Event>, last_id: i64, id_of: F) -> PageScan
where
    F: Fn(&Event) -> Option<i64>,
{
    let mut scan = PageScan::default();

    for entry in entries {
        match id_of(&entry) {
            Some(id) if id <= last_id => {
                scan.reached_known = true;
                break;
            }
            Some(id) => {
                scan.max_id = Some(scan.max_id.map_or(id, |m| m.max(id)));
                scan.fresh.push(entry);
            }
            None => scan.fresh.push(entry),
        }
    }

    scan
}

/// Page through a newest-first listing until `last_id` is reached
///
/// `fetch_page(n)` loads page `n` (starting at 0); [`Page::Items`] with
/// `next == None` means the vendor has no further pages. Zero results is an
/// ordinary empty outcome. A failed page yields a partial output whose
/// `max_id` stays at `last_id`: the pages that were not read hold older ids,
/// and advancing past them would skip those events for good.
pub async fn collect_since<I, F, Fut>(last_id: i64, id_of: I, mut fetch_page: F) -> Result<CursorOutput>
where
    I: Fn(&Event) -> Option<i64>,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Page<u32>>>,
{
    let mut collected = Vec::new();
    let mut max_id = last_id;
    let mut page = 0u32;

    let complete = loop {
        match fetch_page(page).await? {
            Page::Items { events, next } => {
                let scan = scan_page(events, last_id, &id_of);
                collected.extend(scan.fresh);
                if let Some(id) = scan.max_id {
                    max_id = max_id.max(id);
                }

                match next {
                    Some(next) if !scan.reached_known => page = next,
                    _ => break true,
                }
            }
            Page::Failed { status } => {
                tracing::warn!(
                    status,
                    page,
                    collected = collected.len(),
                    "Cursor page request failed"
                );
                break false;
            }
        }
    };

    collected.reverse();

    tracing::debug!(
        last_id,
        max_id,
        pages = page + 1,
        events = collected.len(),
        complete,
        "Cursor fetch finished"
    );

    if complete {
        Ok(CursorOutput {
            output: FetchOutput::complete(collected),
            max_id,
        })
    } else {
        Ok(CursorOutput {
            output: FetchOutput::partial(collected),
            max_id: last_id,
        })
    }
}

/// Read a numeric id from `field`, accepting JSON numbers and numeric strings
pub fn numeric_id(event: &Event, field: &str) -> Option<i64> {
    match event.get(field)? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
