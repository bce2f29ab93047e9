// tests/metrics.rs
// Series exposed through the Prometheus recorder after a pass.
mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;

use common::{default_themes, topic_fetcher, topic_sources, Script, ScriptedFetcher};
use news_digest::cache::MemoryCache;
use news_digest::classify::KeywordClassifier;
use news_digest::embed::HashingEmbedder;
use news_digest::generate::DisabledGenerator;
use news_digest::ingest::{AggregateOptions, Aggregator};
use news_digest::metrics::init_prometheus;
use news_digest::store::{MemoryStore, Store};
use news_digest::{Pipeline, PipelineConfig};

// One recorder per test binary.
static HANDLE: Lazy<PrometheusHandle> =
    Lazy::new(|| init_prometheus().expect("install prometheus recorder in tests"));

#[tokio::test]
async fn aggregate_counters_are_exposed() {
    let handle = &*HANDLE;
    let store = Arc::new(MemoryStore::new());
    store
        .add_source(common::source("Bad", "https://bad.test/feed"))
        .await
        .unwrap();
    let fetcher =
        Arc::new(ScriptedFetcher::new().with_feed("https://bad.test/feed", Script::Fail("boom".into())));

    Aggregator::new(store, fetcher)
        .run_active(&AggregateOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    let text = handle.render();
    assert!(
        text.contains("aggregate_sources_failed_total"),
        "metrics exposition missing failed counter\n{text}"
    );
}

fn sample(text: &str, name: &str) -> Option<f64> {
    text.lines()
        .find_map(|l| l.strip_prefix(name)?.strip_prefix(' '))
        .and_then(|v| v.trim().parse().ok())
}

#[tokio::test]
async fn not_modified_sources_count_as_skipped() {
    let handle = &*HANDLE;
    let store = Arc::new(MemoryStore::new());
    store
        .add_source(common::source("Quiet", "https://quiet.test/feed"))
        .await
        .unwrap();
    let fetcher = Arc::new(
        ScriptedFetcher::new().with_feed("https://quiet.test/feed", Script::Slow(Duration::ZERO)),
    );

    let result = Aggregator::new(store, fetcher)
        .run_active(&AggregateOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!((result.skipped, result.fetched), (1, 0));

    // No other test in this binary sees a not-modified source.
    let text = handle.render();
    assert_eq!(
        sample(&text, "aggregate_sources_skipped_total"),
        Some(1.0),
        "\n{text}"
    );
}

#[tokio::test]
async fn pipeline_pass_exposes_stage_series() {
    let handle = &*HANDLE;
    let mut config = PipelineConfig::default();
    config.sources = topic_sources();
    config.themes = default_themes();
    let pipeline = Pipeline {
        store: Arc::new(MemoryStore::new()),
        fetcher: Arc::new(topic_fetcher(Utc::now(), chrono::Duration::hours(1))),
        classifier: Arc::new(KeywordClassifier::default()),
        embedder: Arc::new(HashingEmbedder::new(128)),
        generator: Arc::new(DisabledGenerator),
        cache: Arc::new(MemoryCache::new()),
        config,
    };
    pipeline.seed().await.unwrap();
    pipeline.run(&CancellationToken::new()).await.unwrap();

    let text = handle.render();
    for needle in [
        "aggregate_sources_fetched_total",
        "aggregate_items_new_total",
        "classify_articles_total",
        "synth_fallback_total",
        "quality_coverage",
        "pipeline_last_run_ts",
    ] {
        assert!(
            text.contains(needle),
            "metrics exposition missing '{needle}'\n{text}"
        );
    }
}
