//! Aggregation pass: every active source through the fetch gate, bounded by a
//! semaphore, with per-source failure isolation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{FeedItem, FetchOutcome, Fetcher};
use crate::error::{PipelineError, Result};
use crate::metrics::ensure_metrics_described;
use crate::model::{Source, SourceId};
use crate::store::{InsertOutcome, Store};

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    /// 0 = no cap.
    pub max_items_per_source: usize,
    pub max_concurrency: usize,
    /// Drop items published before this instant. Undated items are kept.
    pub since: Option<DateTime<Utc>>,
    /// Overall deadline for the pass.
    pub timeout: Option<Duration>,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            max_items_per_source: 25,
            max_concurrency: 8,
            since: None,
            timeout: Some(Duration::from_secs(120)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceError {
    pub source_id: SourceId,
    pub url: String,
    pub message: String,
}

/// Commutative counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateResult {
    pub sources: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub new_items: usize,
    pub duplicates: usize,
    pub errors: Vec<SourceError>,
}

#[derive(Debug)]
enum SourceOutcome {
    NotModified,
    Fetched { new_items: usize, duplicates: usize },
    Failed(SourceError),
}

impl AggregateResult {
    fn merge(&mut self, outcome: SourceOutcome) {
        match outcome {
            SourceOutcome::NotModified => {
                self.skipped += 1;
                counter!("aggregate_sources_skipped_total").increment(1);
            }
            SourceOutcome::Fetched {
                new_items,
                duplicates,
            } => {
                self.fetched += 1;
                self.new_items += new_items;
                self.duplicates += duplicates;
                counter!("aggregate_sources_fetched_total").increment(1);
                counter!("aggregate_items_new_total").increment(new_items as u64);
            }
            SourceOutcome::Failed(err) => {
                self.failed += 1;
                self.errors.push(err);
                counter!("aggregate_sources_failed_total").increment(1);
            }
        }
    }
}

/// Keep items at or after `since`, newest first, at most `cap` (0 = all).
pub fn select_items(
    mut items: Vec<FeedItem>,
    since: Option<DateTime<Utc>>,
    cap: usize,
) -> Vec<FeedItem> {
    if let Some(since) = since {
        items.retain(|it| !matches!(it.published_at, Some(p) if p < since));
    }
    // Undated items sort after dated ones.
    items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    if cap > 0 {
        items.truncate(cap);
    }
    items
}

pub struct Aggregator {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn Fetcher>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn Store>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { store, fetcher }
    }

    /// Load active sources from the store and run a pass over them.
    pub async fn run_active(
        &self,
        opts: &AggregateOptions,
        cancel: &CancellationToken,
    ) -> Result<AggregateResult> {
        let sources = self
            .store
            .list_sources(true)
            .await
            .map_err(PipelineError::store)?;
        self.run(sources, opts, cancel).await
    }

    /// Fetch `sources` concurrently. Only cancellation and the deadline produce `Err`;
    /// in-flight workers are detached, not aborted, when that happens.
    pub async fn run(
        &self,
        sources: Vec<Source>,
        opts: &AggregateOptions,
        cancel: &CancellationToken,
    ) -> Result<AggregateResult> {
        ensure_metrics_described();
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let acc = Arc::new(Mutex::new(AggregateResult {
            sources: sources.len(),
            ..Default::default()
        }));
        let work = self.dispatch(sources, opts.clone(), acc.clone(), cancel.clone());
        let deadline = async {
            match opts.timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(target: "aggregate", "aggregation cancelled");
                return Err(PipelineError::Cancelled);
            }
            _ = deadline => {
                let secs = opts.timeout.map(|d| d.as_secs()).unwrap_or_default();
                warn!(target: "aggregate", secs, "aggregation deadline exceeded");
                return Err(PipelineError::DeadlineExceeded { secs });
            }
            () = work => {}
        }

        let result = match acc.lock() {
            Ok(mut g) => std::mem::take(&mut *g),
            Err(poison) => std::mem::take(&mut *poison.into_inner()),
        };
        info!(
            target: "aggregate",
            sources = result.sources,
            fetched = result.fetched,
            skipped = result.skipped,
            failed = result.failed,
            new_items = result.new_items,
            duplicates = result.duplicates,
            "aggregation finished"
        );
        Ok(result)
    }

    async fn dispatch(
        &self,
        sources: Vec<Source>,
        opts: AggregateOptions,
        acc: Arc<Mutex<AggregateResult>>,
        cancel: CancellationToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(opts.max_concurrency.max(1)));
        let opts = Arc::new(opts);
        let mut handles = Vec::with_capacity(sources.len());

        for source in sources {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            if cancel.is_cancelled() {
                break;
            }
            let store = self.store.clone();
            let fetcher = self.fetcher.clone();
            let acc = acc.clone();
            let opts = opts.clone();
            let ident = (source.id, source.url.clone());

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let outcome = fetch_source(store.as_ref(), fetcher.as_ref(), &source, &opts).await;
                merge_into(&acc, outcome);
            });
            handles.push((ident, handle));
        }

        for ((source_id, url), handle) in handles {
            if let Err(e) = handle.await {
                warn!(target: "aggregate", source_id, error = %e, "aggregate worker died");
                merge_into(
                    &acc,
                    SourceOutcome::Failed(SourceError {
                        source_id,
                        url,
                        message: format!("worker failed: {e}"),
                    }),
                );
            }
        }
    }
}

fn merge_into(acc: &Mutex<AggregateResult>, outcome: SourceOutcome) {
    match acc.lock() {
        Ok(mut g) => g.merge(outcome),
        Err(poison) => poison.into_inner().merge(outcome),
    }
}

async fn fetch_source(
    store: &dyn Store,
    fetcher: &dyn Fetcher,
    source: &Source,
    opts: &AggregateOptions,
) -> SourceOutcome {
    let fail = |message: String| {
        SourceOutcome::Failed(SourceError {
            source_id: source.id,
            url: source.url.clone(),
            message,
        })
    };

    match fetcher
        .fetch(&source.url, source.kind, &source.validators)
        .await
    {
        Ok(FetchOutcome::NotModified) => {
            debug!(target: "aggregate", source_id = source.id, "not modified");
            if let Err(e) = store.record_fetch_success(source.id, None).await {
                return fail(format!("store: {e:#}"));
            }
            SourceOutcome::NotModified
        }
        Ok(FetchOutcome::Fetched { items, validators }) => {
            let items = select_items(items, opts.since, opts.max_items_per_source);
            let mut new_items = 0;
            let mut duplicates = 0;
            for item in &items {
                match store.insert_candidate(source.id, item).await {
                    Ok(InsertOutcome::Inserted(_)) => new_items += 1,
                    Ok(InsertOutcome::Duplicate) => duplicates += 1,
                    Err(e) => return fail(format!("store: {e:#}")),
                }
            }
            if let Err(e) = store.record_fetch_success(source.id, Some(validators)).await {
                return fail(format!("store: {e:#}"));
            }
            debug!(target: "aggregate", source_id = source.id, new_items, duplicates, "fetched");
            SourceOutcome::Fetched {
                new_items,
                duplicates,
            }
        }
        Err(e) => {
            let message = format!("{e:#}");
            warn!(target: "aggregate", source_id = source.id, url = %source.url, error = %message, "source fetch failed");
            if let Err(se) = store.record_fetch_failure(source.id, &message).await {
                warn!(target: "aggregate", source_id = source.id, error = %se, "could not record failure");
            }
            fail(message)
        }
    }
}
