// tests/pipeline_e2e.rs
// Full passes over scripted feeds: offline keyword classifier, hashing embedder.
mod common;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use common::{default_themes, topic_fetcher, topic_sources, ScriptedGenerator};
use news_digest::cache::MemoryCache;
use news_digest::classify::KeywordClassifier;
use news_digest::embed::{Embedder, HashingEmbedder};
use news_digest::generate::{DisabledGenerator, Generator};
use news_digest::model::GeneratedBy;
use news_digest::store::{MemoryStore, Store};
use news_digest::{Pipeline, PipelineConfig, PipelineError};

fn config() -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.sources = topic_sources();
    cfg.themes = default_themes();
    cfg
}

fn pipeline(store: Arc<MemoryStore>, generator: Arc<dyn Generator>, cfg: PipelineConfig) -> Pipeline {
    Pipeline {
        store,
        fetcher: Arc::new(topic_fetcher(Utc::now(), chrono::Duration::hours(1))),
        classifier: Arc::new(KeywordClassifier::default()),
        embedder: Arc::new(HashingEmbedder::new(256)),
        generator,
        cache: Arc::new(MemoryCache::new()),
        config: cfg,
    }
}

#[tokio::test]
async fn twelve_articles_become_one_cited_digest() {
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(store.clone(), Arc::new(ScriptedGenerator), config());
    let seeded = p.seed().await.unwrap();
    assert_eq!((seeded.sources, seeded.themes), (3, 3));

    let report = p.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.aggregate.fetched, 3);
    assert_eq!(report.aggregate.new_items, 12);
    assert_eq!(report.classify.classified, 12);
    assert_eq!(report.summaries.generated, 12);
    assert_eq!(report.clustered_articles, 12);
    assert_eq!(report.clusters.len(), 3);
    assert!(report.clusters.iter().all(|c| c.narrative.is_some()));

    let digest = report.digest.expect("digest");
    assert_eq!(digest.generated_by, GeneratedBy::Llm);
    assert_eq!(digest.article_count(), 12);
    assert_eq!(digest.citations.len(), 12);
    assert!(digest.id > 0);

    let quality = report.quality.expect("quality");
    assert!(quality.coverage >= 0.8, "coverage {}", quality.coverage);
    assert!(quality.uncited_article_ids.is_empty());

    let stored = store.get_digest(digest.id).await.unwrap().unwrap();
    assert_eq!(stored.title, digest.title);
    assert_eq!(store.list_citations(digest.id).await.unwrap().len(), 12);

    let articles = store
        .list_articles_since(Utc::now() - chrono::Duration::days(1))
        .await
        .unwrap();
    assert_eq!(articles.len(), 12);
    assert!(articles.iter().all(|a| a.cluster_label.is_some()));
    assert!(articles.iter().all(|a| a.theme_id.is_some() && a.summary.is_some()));
    assert!(articles.iter().all(|a| !a.needs_embedding()));
}

/// Hashing embedder that refuses any text mentioning Nvidia.
struct RefusesNvidia(HashingEmbedder);

#[async_trait]
impl Embedder for RefusesNvidia {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.contains("Nvidia") {
            bail!("embedding quota exceeded");
        }
        self.0.embed(text).await
    }

    fn dimensions(&self) -> usize {
        self.0.dimensions()
    }

    fn name(&self) -> &'static str {
        "refuses-nvidia"
    }
}

#[tokio::test]
async fn unembedded_articles_count_against_coverage() {
    let store = Arc::new(MemoryStore::new());
    let mut p = pipeline(store.clone(), Arc::new(ScriptedGenerator), config());
    p.embedder = Arc::new(RefusesNvidia(HashingEmbedder::new(256)));
    p.seed().await.unwrap();

    let report = p.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.embed_failures.len(), 1);
    assert_eq!(report.clustered_articles, 11);
    let digest = report.digest.expect("digest");
    assert_eq!(digest.article_count(), 11);

    let quality = report.quality.expect("quality");
    assert_eq!(quality.uncited_article_ids, vec![report.embed_failures[0].article_id]);
    assert!((quality.coverage - 11.0 / 12.0).abs() < 1e-9, "coverage {}", quality.coverage);
}

#[tokio::test]
async fn second_pass_reuses_validators_and_stored_work() {
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(store.clone(), Arc::new(ScriptedGenerator), config());
    p.seed().await.unwrap();
    let cancel = CancellationToken::new();
    p.run(&cancel).await.unwrap();

    // Seeding again registers nothing new.
    assert_eq!(p.seed().await.unwrap().sources, 0);

    let second = p.run(&cancel).await.unwrap();
    assert_eq!(second.aggregate.skipped, 3);
    assert_eq!(second.aggregate.new_items, 0);
    assert_eq!(second.classify.candidates, 0);
    assert_eq!(second.summaries.generated, 0);
    assert!(second.digest.is_some());
}

#[tokio::test]
async fn disabled_generator_falls_back_to_template() {
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(store.clone(), Arc::new(DisabledGenerator), config());
    p.seed().await.unwrap();

    let report = p.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.summaries.fallback, 12);
    let digest = report.digest.expect("template digest");
    assert_eq!(digest.generated_by, GeneratedBy::Template);
    assert_eq!(digest.critique_rounds, 0);
    assert!(digest.title.starts_with("Digest: "));
    let quality = report.quality.expect("quality");
    assert_eq!(quality.coverage, 1.0);
    assert_eq!(quality.vagueness, 0);
}

#[tokio::test]
async fn theme_filter_keeps_only_that_theme() {
    let store = Arc::new(MemoryStore::new());
    let mut cfg = config();
    cfg.classify.theme_filter = Some("Energy".into());
    let p = pipeline(store.clone(), Arc::new(ScriptedGenerator), cfg);
    p.seed().await.unwrap();

    let report = p.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.classify.classified, 4);
    assert_eq!(report.classify.filtered, 8);
    assert_eq!(report.classify.filtered_audit.len(), 8);
    assert_eq!(report.digest.unwrap().article_count(), 4);
}

#[tokio::test]
async fn stale_items_produce_no_digest() {
    let store = Arc::new(MemoryStore::new());
    let mut p = pipeline(store.clone(), Arc::new(ScriptedGenerator), config());
    p.fetcher = Arc::new(topic_fetcher(Utc::now(), chrono::Duration::days(3)));
    p.seed().await.unwrap();

    let report = p.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.aggregate.fetched, 3);
    assert_eq!(report.aggregate.new_items, 0);
    assert!(report.digest.is_none());
    assert!(report.quality.is_none());
}

#[tokio::test]
async fn missing_themes_is_a_config_error() {
    let store = Arc::new(MemoryStore::new());
    let mut cfg = config();
    cfg.themes.clear();
    let p = pipeline(store, Arc::new(ScriptedGenerator), cfg);
    p.seed().await.unwrap();

    let err = p.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
}

#[tokio::test]
async fn cancelled_pass_stops_before_any_stage() {
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(store.clone(), Arc::new(ScriptedGenerator), config());
    p.seed().await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = p.run(&cancel).await.unwrap_err();
    assert!(err.is_cancellation());
    assert!(store.list_unprocessed(0).await.unwrap().is_empty());
    assert!(store
        .list_digests(Utc::now() - chrono::Duration::days(1), Utc::now())
        .await
        .unwrap()
        .is_empty());
}
