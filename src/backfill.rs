//! Replaying exported events from a file
//!
//! Used to backfill a sink from a dump of newline-delimited JSON objects,
//! for example after a collector outage or when onboarding a source with
//! history that predates its first scheduled run. The file is streamed line
//! by line, so multi-gigabyte exports never sit in memory. Each event gets an
//! epoch-millisecond [`INGEST_TIME_FIELD`] parsed from its own time field, and
//! batches go out through the same retrying [`EventSink`] as scheduled runs.
//!
//! Backfills never read or write checkpoints or dedup records.

use serde::Serialize;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::SourceConfig;
use crate::delivery::{EnvelopeOptions, EventSink, deliver};
use crate::enrich::{Enrichment, timestamp_millis};
use crate::error::{Error, Result};
use crate::types::Event;

/// Field receiving the parsed event time (epoch milliseconds)
pub const INGEST_TIME_FIELD: &str = "timestamp";

/// Default number of events per request
pub const DEFAULT_INGEST_BATCH: usize = 50;

/// How to read and publish one export file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileIngest {
    /// Collector token
    pub token: String,
    /// Field holding each event's time
    pub time_field: String,
    /// chrono format of `time_field`; RFC 3339 when `None`
    pub time_format: Option<String>,
    /// Field moved into `sourcetype`, if any
    pub category_field: Option<String>,
    /// Events per request
    pub batch_size: usize,
}

impl FileIngest {
    /// Options with the default batch size and RFC 3339 times
    pub fn new(token: impl Into<String>, time_field: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            time_field: time_field.into(),
            time_format: None,
            category_field: None,
            batch_size: DEFAULT_INGEST_BATCH,
        }
    }

    /// Options taken from a configured source; the source needs a `time_field`
    pub fn for_source(source: &SourceConfig, time_format: Option<String>) -> Result<Self> {
        let time_field = source.time_field.clone().ok_or_else(|| {
            Error::config(
                format!("source {} has no time_field to backfill with", source.id),
                "time_field",
            )
        })?;
        Ok(Self {
            token: source.hec_token.clone(),
            time_field,
            time_format,
            category_field: source.category_field.clone(),
            batch_size: source.batch_size,
        })
    }
}

/// Outcome of a backfill
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Non-blank lines read
    pub lines: usize,
    /// Events accepted by the sink
    pub delivered: usize,
    /// Requests sent
    pub batches: usize,
}

/// Publish every event in the file at `path`
///
/// Blank lines are skipped. A line that is not a JSON object stops the
/// backfill with an error naming the line; batches sent before it stay
/// delivered. A rejected batch stops it the same way.
pub async fn ingest_file(
    sink: &dyn EventSink,
    path: &Path,
    options: &FileIngest,
) -> Result<IngestReport> {
    if options.batch_size == 0 {
        return Err(Error::config("batch size must be positive", "batch_size"));
    }

    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let stamp = timestamp_millis(
        options.time_field.clone(),
        INGEST_TIME_FIELD,
        options.time_format.clone(),
    );
    let envelope = EnvelopeOptions {
        time_field: Some(INGEST_TIME_FIELD.to_string()),
        category_field: options.category_field.clone(),
    };

    let mut report = IngestReport::default();
    let mut pending = Vec::with_capacity(options.batch_size);
    let mut line_no = 0usize;

    tracing::info!(file = %path.display(), batch_size = options.batch_size, "Backfill started");

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        report.lines += 1;
        pending.push(parse_line(&line, line_no, path, &stamp)?);

        if pending.len() == options.batch_size {
            flush(sink, &mut pending, options, &envelope, &mut report).await?;
        }
    }
    if !pending.is_empty() {
        flush(sink, &mut pending, options, &envelope, &mut report).await?;
    }

    tracing::info!(
        file = %path.display(),
        lines = report.lines,
        delivered = report.delivered,
        batches = report.batches,
        "Backfill finished"
    );
    Ok(report)
}

fn parse_line(line: &str, line_no: usize, path: &Path, stamp: &Enrichment) -> Result<Event> {
    let event = serde_json::from_str(line)
        .map_err(Error::from)
        .and_then(Event::from_value)
        .map_err(|e| Error::Other(format!("{}:{}: {}", path.display(), line_no, e)))?;
    Ok(stamp.apply(event))
}

async fn flush(
    sink: &dyn EventSink,
    pending: &mut Vec<Event>,
    options: &FileIngest,
    envelope: &EnvelopeOptions,
    report: &mut IngestReport,
) -> Result<()> {
    let batch = std::mem::take(pending);
    let delivered = deliver(sink, &[batch.as_slice()], &options.token, envelope, |_, _| {}).await?;
    report.delivered += delivered;
    report.batches += 1;
    tracing::debug!(batch = report.batches, delivered = report.delivered, "Backfill batch sent");
    Ok(())
}
