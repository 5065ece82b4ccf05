//! Run pipeline stages

use std::time::Instant;

use super::{Preview, RunReport, RunRequest, RunState, RunTarget, SyncEngine};
use crate::batch::chunk;
use crate::checkpoint::CommittedCheckpoint;
use crate::clock::Clock;
use crate::config::Continuation;
use crate::delivery::{EnvelopeOptions, deliver, replace_collection};
use crate::error::{Error, Result};
use crate::fetch::{FetchOutput, apply_partial_policy};
use crate::registry::{Fetcher, RegisteredSource};
use crate::store::CheckpointStore;
use crate::types::{Event, SourceId};
use crate::window::{WindowMode, WindowPlan};

/// Where a run's checkpoint comes from and goes to
enum Position {
    Window(WindowPlan),
    Cursor {
        previous: i64,
        max_id: i64,
        persisted: bool,
    },
    Snapshot {
        collection: String,
        token: String,
    },
}

/// Output of the fetch stage
struct Fetched {
    position: Position,
    target: RunTarget,
    events: Vec<Event>,
    partial: bool,
}

fn log_state(source: &SourceId, state: RunState) {
    tracing::debug!(source = %source, state = %state, "Run state");
}

fn unsupported(source: &RegisteredSource, request: RunRequest) -> Error {
    Error::config(
        format!(
            "{} source {} does not support {:?} runs",
            source.fetcher.kind(),
            source.config.id,
            request
        ),
        "request",
    )
}

impl SyncEngine {
    /// Run `id` once
    ///
    /// Returns [`Error::RunInProgress`] if the source is already running on
    /// this engine. An error raised before every batch is delivered leaves the
    /// store untouched. Delivered ids are recorded after the checkpoint, so if
    /// recording them fails the error is returned with the checkpoint already
    /// appended, and those events may be delivered again by a later fetch.
    pub async fn run(&self, id: &SourceId, request: RunRequest) -> Result<RunReport> {
        let source = self.registry.get(id)?;
        let _guard = self.claim(id)?;
        let started = Instant::now();

        log_state(id, RunState::Started);
        let result = self.execute(source, request).await;

        match &result {
            Ok(report) => tracing::info!(
                source = %id,
                target = %report.target,
                fetched = report.fetched,
                delivered = report.delivered,
                batches = report.batches,
                partial = report.partial,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Run finished"
            ),
            Err(e) => tracing::error!(
                source = %id,
                error = %e,
                code = e.error_code(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Run failed"
            ),
        }
        result
    }

    /// Fetch, enrich and dedup-filter without delivering or writing anything
    pub async fn preview(&self, id: &SourceId, request: RunRequest) -> Result<Preview> {
        let source = self.registry.get(id)?;
        let fetched = self.fetch(source, request).await?;
        let total = fetched.events.len();
        let events = self.filter(source, fetched.events).await?;

        tracing::info!(
            source = %id,
            target = %fetched.target,
            fetched = total,
            new_events = events.len(),
            "Preview finished"
        );

        Ok(Preview {
            target: fetched.target,
            events,
            fetched: total,
            partial: fetched.partial,
        })
    }

    async fn execute(&self, source: &RegisteredSource, request: RunRequest) -> Result<RunReport> {
        let id = &source.config.id;

        let Fetched {
            position,
            target,
            events,
            partial,
        } = self.fetch(source, request).await?;
        let fetched = events.len();

        if let Position::Snapshot { collection, token } = &position {
            return self
                .replace(source, target, collection, token, events, partial)
                .await;
        }

        // Windowed checkpoints advance on everything fetched, duplicates included
        let observed = match &position {
            Position::Window(plan) if plan.persisted && self.is_windowed(source) => {
                Some(events.clone())
            }
            _ => None,
        };

        let fresh = self.filter(source, events).await?;
        log_state(id, RunState::Deduped);

        let chunks = chunk(&fresh, source.config.batch_size)?;
        let options = EnvelopeOptions::for_source(&source.config);
        let delivered = deliver(
            self.context.events.as_ref(),
            &chunks,
            &source.config.hec_token,
            &options,
            |batch, batches| log_state(id, RunState::Delivering { batch, batches }),
        )
        .await?;
        log_state(id, RunState::Delivered);

        let checkpoint = self
            .commit(source, &position, observed.as_deref(), fetched)
            .await?;

        // Delivered ids are recorded even by ad hoc runs
        if let Some(spec) = &source.config.dedup_id {
            self.dedup
                .mark_seen(&fresh, spec, &source.config.store_key, self.context.clock.now())
                .await?;
        }

        let state = if checkpoint.is_some() {
            log_state(id, RunState::Checkpointed);
            RunState::Checkpointed
        } else {
            RunState::Delivered
        };

        Ok(RunReport {
            source: id.clone(),
            target,
            fetched,
            new_events: fresh.len(),
            delivered,
            batches: chunks.len(),
            partial,
            checkpoint,
            state,
        })
    }

    fn is_windowed(&self, source: &RegisteredSource) -> bool {
        source.config.continuation == Continuation::Windowed
    }

    /// Decide the target, call the vendor, apply the partial policy and enrich
    async fn fetch(&self, source: &RegisteredSource, request: RunRequest) -> Result<Fetched> {
        let config = &source.config;
        let key = &config.store_key;

        let (position, target, output) = match (&source.fetcher, request) {
            (Fetcher::Range(fetcher), RunRequest::Lookback { .. } | RunRequest::Resume { .. }) => {
                let mode = match request {
                    RunRequest::Lookback { n, unit } => WindowMode::Lookback { n, unit },
                    RunRequest::Resume { unit } if config.continuation == Continuation::Simple => {
                        WindowMode::Simple { unit }
                    }
                    _ => WindowMode::Windowed,
                };
                let plan = self.calculator.plan(key, mode).await?;
                let target = RunTarget::Window {
                    window: plan.window,
                    persisted: plan.persisted,
                };
                log_state(&config.id, RunState::WindowComputed);
                tracing::info!(source = %config.id, window = %plan.window, "Fetching window");

                let output = fetcher.fetch_range(&plan.window).await?;
                (Position::Window(plan), target, output)
            }
            (Fetcher::Cursor(fetcher), RunRequest::FromCursor { .. } | RunRequest::Resume { .. }) => {
                let (after_id, persisted) = match request {
                    RunRequest::FromCursor { after_id } => (after_id, false),
                    _ => {
                        let latest = self.context.store.latest_cursor(key).await?;
                        let after_id = latest.map_or(config.initial_cursor, |c| c.last_id);
                        (after_id, true)
                    }
                };
                let target = RunTarget::Cursor {
                    after_id,
                    persisted,
                };
                log_state(&config.id, RunState::WindowComputed);
                tracing::info!(source = %config.id, after_id, "Fetching after cursor");

                let cursor = fetcher.fetch_since(after_id).await?;
                let position = Position::Cursor {
                    previous: after_id,
                    max_id: cursor.max_id,
                    persisted,
                };
                (position, target, cursor.output)
            }
            (Fetcher::Snapshot(fetcher), RunRequest::Snapshot | RunRequest::Resume { .. }) => {
                let (Some(collection), Some(token)) =
                    (config.collection.clone(), config.collection_token.clone())
                else {
                    return Err(Error::config(
                        format!("snapshot source {} needs a collection and token", config.id),
                        "collection",
                    ));
                };
                let target = RunTarget::Snapshot {
                    collection: collection.clone(),
                };
                log_state(&config.id, RunState::WindowComputed);

                let output = fetcher.fetch_all().await?;
                (Position::Snapshot { collection, token }, target, output)
            }
            _ => return Err(unsupported(source, request)),
        };

        let FetchOutput { events, complete } =
            apply_partial_policy(&config.id, output, config.partial_pages)?;
        log_state(&config.id, RunState::Fetched);
        tracing::info!(
            source = %config.id,
            fetched = events.len(),
            complete,
            "Fetched events"
        );

        let events = if source.enrichment.is_empty() {
            events
        } else {
            source.enrichment.apply_all(events)
        };

        Ok(Fetched {
            position,
            target,
            events,
            partial: !complete,
        })
    }

    async fn filter(&self, source: &RegisteredSource, events: Vec<Event>) -> Result<Vec<Event>> {
        match &source.config.dedup_id {
            Some(spec) if !events.is_empty() => {
                self.dedup
                    .filter_new(events, spec, &source.config.store_key)
                    .await
            }
            _ => Ok(events),
        }
    }

    async fn commit(
        &self,
        source: &RegisteredSource,
        position: &Position,
        observed: Option<&[Event]>,
        fetched: usize,
    ) -> Result<Option<CommittedCheckpoint>> {
        let key = &source.config.store_key;

        let checkpoint = match position {
            Position::Window(plan) if plan.persisted => {
                let committed = match observed {
                    Some(events) => {
                        self.writer
                            .commit_windowed(
                                key,
                                &plan.window,
                                events,
                                source.config.time_field.as_deref(),
                                source.config.empty_window,
                            )
                            .await?
                    }
                    None => self.writer.commit_simple(key, &plan.window).await?,
                };
                Some(CommittedCheckpoint::Range(committed))
            }
            Position::Cursor {
                previous,
                max_id,
                persisted: true,
            } => {
                let committed = self
                    .writer
                    .commit_cursor(key, *previous, *max_id, fetched)
                    .await?;
                Some(CommittedCheckpoint::Cursor(committed))
            }
            _ => None,
        };
        Ok(checkpoint)
    }

    /// Replace a snapshot source's collection with everything fetched
    async fn replace(
        &self,
        source: &RegisteredSource,
        target: RunTarget,
        collection: &str,
        token: &str,
        records: Vec<Event>,
        partial: bool,
    ) -> Result<RunReport> {
        let id = &source.config.id;
        let batch_size = source.config.batch_size;
        let batches = records.len().div_ceil(batch_size.max(1));

        log_state(id, RunState::Delivering { batch: 1, batches });
        let delivered = replace_collection(
            self.context.collections.as_ref(),
            collection,
            &records,
            batch_size,
            token,
        )
        .await?;
        log_state(id, RunState::Delivered);

        Ok(RunReport {
            source: id.clone(),
            target,
            fetched: records.len(),
            new_events: records.len(),
            delivered,
            batches,
            partial,
            checkpoint: None,
            state: RunState::Delivered,
        })
    }
}
