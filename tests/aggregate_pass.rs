// tests/aggregate_pass.rs
mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use common::{feed_item, source, InFlightFetcher, Script, ScriptedFetcher};
use news_digest::ingest::{AggregateOptions, Aggregator};
use news_digest::model::NewSource;
use news_digest::store::{MemoryStore, Store};
use news_digest::PipelineError;

fn opts() -> AggregateOptions {
    AggregateOptions {
        max_items_per_source: 0,
        max_concurrency: 2,
        since: None,
        timeout: Some(Duration::from_secs(30)),
    }
}

fn two_item_feed(prefix: &str) -> Script {
    let now = Utc::now();
    Script::Feed {
        items: vec![
            feed_item(&format!("https://{prefix}/1"), "First story", now),
            feed_item(&format!("https://{prefix}/2"), "Second story", now),
        ],
        etag: "\"abc\"".into(),
    }
}

#[tokio::test]
async fn second_pass_is_conditional_and_adds_nothing() {
    let store = Arc::new(MemoryStore::new());
    let id = store
        .add_source(source("A", "https://a.test/feed"))
        .await
        .unwrap();
    let fetcher =
        Arc::new(ScriptedFetcher::new().with_feed("https://a.test/feed", two_item_feed("a.test")));
    let agg = Aggregator::new(store.clone(), fetcher.clone());
    let cancel = CancellationToken::new();

    let first = agg.run_active(&opts(), &cancel).await.unwrap();
    assert_eq!(first.fetched, 1);
    assert_eq!(first.new_items, 2);
    let stored = store.get_source(id).await.unwrap().unwrap();
    assert_eq!(stored.validators.etag.as_deref(), Some("\"abc\""));
    assert!(stored.last_fetched_at.is_some());

    let second = agg.run_active(&opts(), &cancel).await.unwrap();
    assert_eq!(second.skipped, 1);
    assert_eq!(second.fetched, 0);
    assert_eq!(second.new_items, 0);
    assert_eq!(store.list_unprocessed(0).await.unwrap().len(), 2);
    assert_eq!(fetcher.feed_calls(), 2);
}

#[tokio::test]
async fn failing_source_is_isolated() {
    let store = Arc::new(MemoryStore::new());
    store
        .add_source(source("Good", "https://good.test/feed"))
        .await
        .unwrap();
    let bad_id = store
        .add_source(source("Bad", "https://bad.test/feed"))
        .await
        .unwrap();
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .with_feed("https://good.test/feed", two_item_feed("good.test"))
            .with_feed("https://bad.test/feed", Script::Fail("HTTP 503".into())),
    );

    let result = Aggregator::new(store.clone(), fetcher)
        .run_active(&opts(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.sources, 2);
    assert_eq!(result.fetched, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.new_items, 2);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].source_id, bad_id);
    assert!(result.errors[0].message.contains("503"));

    let bad = store.get_source(bad_id).await.unwrap().unwrap();
    assert_eq!(bad.error_count, 1);
    assert!(bad.last_error.unwrap().contains("503"));
}

#[tokio::test]
async fn inactive_sources_are_not_fetched() {
    let store = Arc::new(MemoryStore::new());
    store
        .add_source(NewSource {
            active: false,
            ..source("Off", "https://off.test/feed")
        })
        .await
        .unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new());

    let result = Aggregator::new(store, fetcher.clone())
        .run_active(&opts(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.sources, 0);
    assert_eq!(fetcher.feed_calls(), 0);
}

#[tokio::test]
async fn pre_cancelled_pass_touches_nothing() {
    let store = Arc::new(MemoryStore::new());
    store
        .add_source(source("A", "https://a.test/feed"))
        .await
        .unwrap();
    let fetcher =
        Arc::new(ScriptedFetcher::new().with_feed("https://a.test/feed", two_item_feed("a.test")));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = Aggregator::new(store.clone(), fetcher.clone())
        .run_active(&opts(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
    assert_eq!(fetcher.feed_calls(), 0);
    assert!(store.list_unprocessed(0).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_during_slow_fetch_returns_cancelled() {
    let store = Arc::new(MemoryStore::new());
    store
        .add_source(source("Slow", "https://slow.test/feed"))
        .await
        .unwrap();
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .with_feed("https://slow.test/feed", Script::Slow(Duration::from_secs(60))),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = Aggregator::new(store, fetcher)
        .run_active(&opts(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn deadline_is_reported_distinctly() {
    let store = Arc::new(MemoryStore::new());
    store
        .add_source(source("Slow", "https://slow.test/feed"))
        .await
        .unwrap();
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .with_feed("https://slow.test/feed", Script::Slow(Duration::from_secs(60))),
    );
    let opts = AggregateOptions {
        timeout: Some(Duration::from_secs(2)),
        ..opts()
    };

    let err = Aggregator::new(store, fetcher)
        .run_active(&opts, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::DeadlineExceeded { secs: 2 }));
    assert!(err.is_cancellation());
}

#[tokio::test]
async fn per_source_cap_keeps_newest() {
    let store = Arc::new(MemoryStore::new());
    store
        .add_source(source("A", "https://a.test/feed"))
        .await
        .unwrap();
    let now = Utc::now();
    let items = (0..5)
        .map(|i| {
            feed_item(
                &format!("https://a.test/{i}"),
                &format!("Story {i}"),
                now - chrono::Duration::hours(i),
            )
        })
        .collect();
    let fetcher = Arc::new(ScriptedFetcher::new().with_feed(
        "https://a.test/feed",
        Script::Feed {
            items,
            etag: "\"x\"".into(),
        },
    ));
    let opts = AggregateOptions {
        max_items_per_source: 2,
        ..opts()
    };

    let result = Aggregator::new(store.clone(), fetcher)
        .run_active(&opts, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.new_items, 2);
    let mut links: Vec<String> = store
        .list_unprocessed(0)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.link)
        .collect();
    links.sort();
    assert_eq!(links, vec!["https://a.test/0", "https://a.test/1"]);
}

#[tokio::test(start_paused = true)]
async fn fetches_never_exceed_max_concurrency() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..6 {
        store
            .add_source(source(&format!("S{i}"), &format!("https://s{i}.test/feed")))
            .await
            .unwrap();
    }
    let fetcher = Arc::new(InFlightFetcher::new(Duration::from_millis(100)));

    let result = Aggregator::new(store, fetcher.clone())
        .run_active(&opts(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.skipped, 6);
    assert_eq!(fetcher.calls(), 6);
    assert_eq!(fetcher.peak(), opts().max_concurrency);
}
