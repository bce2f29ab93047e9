//! End-to-end batch pass:
//! aggregate → classify → summarize → embed → cluster → synthesize → store → evaluate.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::gauge;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{ContentCache, FileCache, MemoryCache};
use crate::classify::{Classifier, ClassifyPass, ClassifyStats, KeywordClassifier, LlmClassifier};
use crate::cluster::{apply_labels, cluster_articles};
use crate::config::PipelineConfig;
use crate::embed::{build_embedder, embed_articles, EmbedFailure, Embedder};
use crate::error::{PipelineError, Result};
use crate::generate::{build_generator, Generator};
use crate::ingest::{AggregateResult, Aggregator, Fetcher, HttpFetcher};
use crate::metrics::ensure_metrics_described;
use crate::model::{Digest, TopicCluster};
use crate::quality::{evaluate, QualityReport};
use crate::store::Store;
use crate::synth::{SummaryStats, Synthesizer};

const FETCH_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub aggregate: AggregateResult,
    pub classify: ClassifyStats,
    pub summaries: SummaryStats,
    pub clustered_articles: usize,
    pub clusters: Vec<TopicCluster>,
    pub embed_failures: Vec<EmbedFailure>,
    pub digest: Option<Digest>,
    pub quality: Option<QualityReport>,
}

/// Registered sources/themes added by [`Pipeline::seed`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub sources: usize,
    pub themes: usize,
}

pub struct Pipeline {
    pub store: Arc<dyn Store>,
    pub fetcher: Arc<dyn Fetcher>,
    pub classifier: Arc<dyn Classifier>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub cache: Arc<dyn ContentCache>,
    pub config: PipelineConfig,
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

impl Pipeline {
    /// Production wiring: HTTP fetcher, configured AI backend (or offline
    /// keyword/hashing fallbacks), file or memory cache.
    pub fn from_config(config: PipelineConfig, store: Arc<dyn Store>) -> Result<Self> {
        config.validate()?;
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(FETCH_TIMEOUT)?);
        let generator = build_generator(&config.ai)?;
        let embedder = build_embedder(&config.ai)?;
        let classifier: Arc<dyn Classifier> = if config.ai.enabled() {
            Arc::new(LlmClassifier::new(generator.clone()))
        } else {
            Arc::new(KeywordClassifier::default())
        };
        let cache: Arc<dyn ContentCache> = match &config.cache.dir {
            Some(dir) => Arc::new(FileCache::new(dir)),
            None => Arc::new(MemoryCache::new()),
        };
        info!(
            target: "pipeline",
            fetcher = fetcher.name(),
            generator = generator.name(),
            embedder = embedder.name(),
            classifier = classifier.name(),
            "pipeline wired"
        );
        Ok(Self {
            store,
            fetcher,
            classifier,
            embedder,
            generator,
            cache,
            config,
        })
    }

    /// Register configured sources and themes that the store does not know yet.
    pub async fn seed(&self) -> Result<SeedReport> {
        let mut report = SeedReport::default();
        let known_urls: HashSet<String> = self
            .store
            .list_sources(false)
            .await
            .map_err(PipelineError::store)?
            .into_iter()
            .map(|s| s.url)
            .collect();
        for s in &self.config.sources {
            if !known_urls.contains(&s.url) {
                self.store
                    .add_source(s.clone())
                    .await
                    .map_err(PipelineError::store)?;
                report.sources += 1;
            }
        }
        let known_themes: HashSet<String> = self
            .store
            .list_themes(false)
            .await
            .map_err(PipelineError::store)?
            .into_iter()
            .map(|t| t.name)
            .collect();
        for t in &self.config.themes {
            if !known_themes.contains(&t.name) {
                self.store
                    .add_theme(t.clone())
                    .await
                    .map_err(PipelineError::store)?;
                report.themes += 1;
            }
        }
        Ok(report)
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<PipelineReport> {
        ensure_metrics_described();
        self.config.validate()?;
        let now = Utc::now();

        let aggregate = Aggregator::new(self.store.clone(), self.fetcher.clone())
            .run_active(&self.config.aggregate_options(now), cancel)
            .await?;
        checkpoint(cancel)?;

        let classify = ClassifyPass::new(
            self.store.clone(),
            self.fetcher.clone(),
            self.classifier.clone(),
            self.cache.clone(),
        )
        .run(&self.config.classify_options(), cancel)
        .await?;
        checkpoint(cancel)?;

        let mut report = PipelineReport {
            aggregate,
            classify,
            summaries: SummaryStats::default(),
            clustered_articles: 0,
            clusters: Vec::new(),
            embed_failures: Vec::new(),
            digest: None,
            quality: None,
        };

        let mut articles = self
            .store
            .list_articles_since(self.config.window_start(now))
            .await
            .map_err(PipelineError::store)?;
        articles.sort_by_key(|a| a.id);
        if articles.is_empty() {
            info!(target: "pipeline", "no articles in window; nothing to digest");
            log_summary(&report);
            return Ok(report);
        }

        let synth = Synthesizer::new(
            self.generator.clone(),
            self.cache.clone(),
            self.config.synth_options(),
        );
        report.summaries = synth.summarize_articles(&mut articles).await;
        let embed = embed_articles(&mut articles, self.embedder.as_ref()).await;
        report.embed_failures = embed.failures;
        checkpoint(cancel)?;

        let themes = self
            .store
            .list_themes(false)
            .await
            .map_err(PipelineError::store)?;
        let clusterable: Vec<_> = articles
            .iter()
            .filter(|a| !a.needs_embedding())
            .cloned()
            .collect();
        let clusters = cluster_articles(
            &clusterable,
            self.config.cluster.k,
            &self.config.cluster_params(),
            &themes,
        );
        apply_labels(&mut articles, &clusters);
        for a in &articles {
            self.store
                .update_article(a)
                .await
                .map_err(PipelineError::store)?;
        }
        report.clustered_articles = clusterable.len();
        if clusters.is_empty() {
            warn!(target: "pipeline", failures = report.embed_failures.len(), "no embeddable articles; nothing to digest");
            log_summary(&report);
            return Ok(report);
        }
        checkpoint(cancel)?;

        let labelled: Vec<_> = articles
            .iter()
            .filter(|a| !a.needs_embedding())
            .cloned()
            .collect();
        let synthesis = synth.synthesize(clusters, &labelled).await;
        let mut digest = synthesis.digest;
        let id = self
            .store
            .insert_digest(digest.clone())
            .await
            .map_err(PipelineError::store)?;
        digest.id = id;
        self.store
            .insert_citations(id, &digest.citations)
            .await
            .map_err(PipelineError::store)?;

        // Graded against the whole window; unembedded articles count as uncited.
        let quality = evaluate(&digest, &articles, &self.config.quality);
        gauge!("quality_coverage").set(quality.coverage);
        gauge!("pipeline_last_run_ts").set(Utc::now().timestamp() as f64);
        info!(
            target: "quality",
            digest_id = id,
            grade = %quality.grade,
            coverage = quality.coverage,
            vagueness = quality.vagueness,
            specificity = quality.specificity,
            excluded = report.embed_failures.len(),
            "digest graded"
        );

        report.clusters = synthesis.clusters;
        report.digest = Some(digest);
        report.quality = Some(quality);
        log_summary(&report);
        Ok(report)
    }
}

fn log_summary(r: &PipelineReport) {
    info!(
        target: "pipeline",
        fetched = r.aggregate.fetched,
        skipped = r.aggregate.skipped,
        failed = r.aggregate.failed,
        new_items = r.aggregate.new_items,
        classified = r.classify.classified,
        filtered = r.classify.filtered,
        below_threshold = r.classify.below_threshold,
        clustered = r.clustered_articles,
        clusters = r.clusters.len(),
        digest = r.digest.as_ref().map(|d| d.id).unwrap_or_default(),
        "pipeline pass finished"
    );
}
