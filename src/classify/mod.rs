//! Relevance classification: score candidates against themes, decide, store.
//!
//! Scoring (body fetch + classifier call) runs on its own bounded worker pool.
//! Decisions are then committed sequentially in candidate order, so the
//! near-duplicate guard sees a deterministic "accepted earlier" set.

pub mod dedup;
pub mod keyword;
pub mod llm;

pub use dedup::NearDuplicateGuard;
pub use keyword::KeywordClassifier;
pub use llm::LlmClassifier;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{body_key, ContentCache, BODY_TTL};
use crate::error::{PipelineError, Result};
use crate::ingest::Fetcher;
use crate::metrics::ensure_metrics_described;
use crate::model::{Article, CandidateId, CandidateItem, Theme, ThemeId};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeScore {
    pub theme_id: ThemeId,
    pub theme_name: String,
    /// In [0, 1].
    pub score: f32,
    pub reasoning: String,
}

/// Scores an article against every theme. Decisions are made by [`decide`], not here.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn score(&self, article: &Article, themes: &[Theme]) -> AnyResult<Vec<ThemeScore>>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThemeMatch {
    pub theme_id: ThemeId,
    pub theme_name: String,
    pub score: f32,
    pub reasoning: String,
}

/// Highest score at or above `min_relevance`; ties go to the lowest theme id.
pub fn best_match(scores: &[ThemeScore], min_relevance: f32) -> Option<ThemeMatch> {
    let mut best: Option<&ThemeScore> = None;
    for s in scores.iter().filter(|s| s.score.is_finite()) {
        best = match best {
            None => Some(s),
            Some(b) if s.score > b.score || (s.score == b.score && s.theme_id < b.theme_id) => {
                Some(s)
            }
            keep => keep,
        };
    }
    best.filter(|b| b.score >= min_relevance).map(|b| ThemeMatch {
        theme_id: b.theme_id,
        theme_name: b.theme_name.clone(),
        score: b.score,
        reasoning: b.reasoning.clone(),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Accepted(ThemeMatch),
    BelowThreshold,
    /// Matched a theme other than the configured filter.
    Filtered { would_match: String },
}

pub fn decide(scores: &[ThemeScore], min_relevance: f32, theme_filter: Option<&str>) -> Decision {
    match best_match(scores, min_relevance) {
        None => Decision::BelowThreshold,
        Some(m) => match theme_filter {
            Some(f) if !f.trim().eq_ignore_ascii_case(m.theme_name.trim()) => {
                Decision::Filtered {
                    would_match: m.theme_name,
                }
            }
            _ => Decision::Accepted(m),
        },
    }
}

#[derive(Debug, Clone)]
pub struct ClassifyOptions {
    pub min_relevance: f32,
    pub theme_filter: Option<String>,
    pub max_concurrency: usize,
    pub timeout: Option<Duration>,
    pub dedup_similarity: f64,
    pub body_ttl: Duration,
}

impl Default for ClassifyOptions {
    fn default() -> Self {
        Self {
            min_relevance: 0.5,
            theme_filter: None,
            max_concurrency: 4,
            timeout: Some(Duration::from_secs(300)),
            dedup_similarity: 0.92,
            body_ttl: BODY_TTL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifyError {
    pub candidate_id: CandidateId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilteredItem {
    pub candidate_id: CandidateId,
    pub theme_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassifyStats {
    pub candidates: usize,
    pub classified: usize,
    pub filtered: usize,
    pub below_threshold: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub errors: Vec<ClassifyError>,
    pub filtered_audit: Vec<FilteredItem>,
}

struct Scored {
    candidate: CandidateItem,
    article: Article,
    scores: AnyResult<Vec<ThemeScore>>,
}

pub struct ClassifyPass {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn Fetcher>,
    classifier: Arc<dyn Classifier>,
    cache: Arc<dyn ContentCache>,
}

impl ClassifyPass {
    pub fn new(
        store: Arc<dyn Store>,
        fetcher: Arc<dyn Fetcher>,
        classifier: Arc<dyn Classifier>,
        cache: Arc<dyn ContentCache>,
    ) -> Self {
        Self {
            store,
            fetcher,
            classifier,
            cache,
        }
    }

    pub async fn run(&self, opts: &ClassifyOptions, cancel: &CancellationToken) -> Result<ClassifyStats> {
        ensure_metrics_described();
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let themes = self
            .store
            .list_themes(true)
            .await
            .map_err(PipelineError::store)?;
        if themes.is_empty() {
            return Err(PipelineError::Config("no enabled themes".into()));
        }
        let candidates = self
            .store
            .list_unprocessed(0)
            .await
            .map_err(PipelineError::store)?;

        let mut stats = ClassifyStats {
            candidates: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            return Ok(stats);
        }

        let acc: Arc<Mutex<Vec<Scored>>> = Arc::new(Mutex::new(Vec::with_capacity(candidates.len())));
        let themes = Arc::new(themes);
        let work = self.score_all(candidates, themes, opts, acc.clone(), cancel.clone());
        let deadline = async {
            match opts.timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        let died = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(target: "classify", "classification cancelled");
                return Err(PipelineError::Cancelled);
            }
            _ = deadline => {
                let secs = opts.timeout.map(|d| d.as_secs()).unwrap_or_default();
                warn!(target: "classify", secs, "classification deadline exceeded");
                return Err(PipelineError::DeadlineExceeded { secs });
            }
            died = work => died,
        };

        let mut scored = match acc.lock() {
            Ok(mut g) => std::mem::take(&mut *g),
            Err(poison) => std::mem::take(&mut *poison.into_inner()),
        };
        scored.sort_by_key(|s| s.candidate.id);

        let mut guard = NearDuplicateGuard::new(opts.dedup_similarity);
        for s in scored {
            self.commit(s, opts, &mut guard, &mut stats).await?;
        }
        // Dead workers leave their candidate unprocessed for the next pass.
        for e in died {
            stats.failed += 1;
            counter!("classify_articles_total", "outcome" => "failed").increment(1);
            stats.errors.push(e);
        }

        info!(
            target: "classify",
            candidates = stats.candidates,
            classified = stats.classified,
            filtered = stats.filtered,
            below_threshold = stats.below_threshold,
            duplicates = stats.duplicates,
            failed = stats.failed,
            "classification finished"
        );
        Ok(stats)
    }

    async fn score_all(
        &self,
        candidates: Vec<CandidateItem>,
        themes: Arc<Vec<Theme>>,
        opts: &ClassifyOptions,
        acc: Arc<Mutex<Vec<Scored>>>,
        cancel: CancellationToken,
    ) -> Vec<ClassifyError> {
        let semaphore = Arc::new(Semaphore::new(opts.max_concurrency.max(1)));
        let mut handles = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            if cancel.is_cancelled() {
                break;
            }
            let fetcher = self.fetcher.clone();
            let classifier = self.classifier.clone();
            let cache = self.cache.clone();
            let themes = themes.clone();
            let acc = acc.clone();
            let body_ttl = opts.body_ttl;

            let candidate_id = candidate.id;
            handles.push((candidate_id, tokio::spawn(async move {
                let _permit = permit;
                let article = build_article(fetcher.as_ref(), cache.as_ref(), &candidate, body_ttl).await;
                let scores = classifier.score(&article, &themes).await;
                let scored = Scored {
                    candidate,
                    article,
                    scores,
                };
                match acc.lock() {
                    Ok(mut g) => g.push(scored),
                    Err(poison) => poison.into_inner().push(scored),
                }
            })));
        }

        let mut died = Vec::new();
        for (candidate_id, h) in handles {
            if let Err(e) = h.await {
                warn!(target: "classify", candidate_id, error = %e, "classify worker died");
                died.push(ClassifyError {
                    candidate_id,
                    message: format!("worker failed: {e}"),
                });
            }
        }
        died
    }

    async fn commit(
        &self,
        s: Scored,
        opts: &ClassifyOptions,
        guard: &mut NearDuplicateGuard,
        stats: &mut ClassifyStats,
    ) -> Result<()> {
        let Scored {
            candidate,
            mut article,
            scores,
        } = s;

        let scores = match scores {
            Ok(v) => v,
            Err(e) => {
                warn!(target: "classify", candidate_id = candidate.id, error = %e, "classifier failed");
                stats.failed += 1;
                stats.errors.push(ClassifyError {
                    candidate_id: candidate.id,
                    message: format!("{e:#}"),
                });
                counter!("classify_articles_total", "outcome" => "failed").increment(1);
                return Ok(());
            }
        };

        let outcome = match decide(&scores, opts.min_relevance, opts.theme_filter.as_deref()) {
            Decision::Accepted(m) if guard.is_duplicate(&article.title) => {
                debug!(target: "classify", candidate_id = candidate.id, theme = %m.theme_name, "near-duplicate title");
                stats.duplicates += 1;
                "duplicate"
            }
            Decision::Accepted(m) => {
                article.theme_id = Some(m.theme_id);
                article.relevance = Some(m.score);
                guard.remember(&article.title);
                self.store
                    .insert_article(article)
                    .await
                    .map_err(PipelineError::store)?;
                stats.classified += 1;
                "classified"
            }
            Decision::Filtered { would_match } => {
                stats.filtered += 1;
                stats.filtered_audit.push(FilteredItem {
                    candidate_id: candidate.id,
                    theme_name: would_match,
                });
                "filtered"
            }
            Decision::BelowThreshold => {
                stats.below_threshold += 1;
                "below_threshold"
            }
        };
        counter!("classify_articles_total", "outcome" => outcome).increment(1);

        self.store
            .mark_processed(candidate.id)
            .await
            .map_err(PipelineError::store)?;
        Ok(())
    }
}

/// Body from cache, else fetched (and cached), else the feed description.
async fn build_article(
    fetcher: &dyn Fetcher,
    cache: &dyn ContentCache,
    candidate: &CandidateItem,
    body_ttl: Duration,
) -> Article {
    let key = body_key(&candidate.link);
    let body = match cache.get(&key, body_ttl) {
        Some(hit) => Some(hit),
        None => match fetcher.fetch_article_body(&candidate.link).await {
            Ok(text) if !text.trim().is_empty() => {
                cache.put(&key, &text);
                Some(text)
            }
            Ok(_) => None,
            Err(e) => {
                debug!(target: "classify", url = %candidate.link, error = %e, "body fetch failed; using description");
                None
            }
        },
    };
    let text = body.unwrap_or_else(|| candidate.description.clone());
    let mut article = Article::new(candidate.link.clone(), candidate.title.clone(), text);
    article.candidate_id = Some(candidate.id);
    article.published_at = candidate.published_at;
    article
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(id: i64, name: &str, s: f32) -> ThemeScore {
        ThemeScore {
            theme_id: id,
            theme_name: name.into(),
            score: s,
            reasoning: String::new(),
        }
    }

    #[test]
    fn best_match_ties_go_to_lowest_theme_id() {
        let scores = vec![score(3, "c", 0.7), score(1, "a", 0.7), score(2, "b", 0.2)];
        let m = best_match(&scores, 0.5).unwrap();
        assert_eq!(m.theme_id, 1);
    }

    #[test]
    fn best_match_respects_threshold() {
        let scores = vec![score(1, "a", 0.4)];
        assert!(best_match(&scores, 0.5).is_none());
        assert!(best_match(&scores, 0.4).is_some());
        assert!(best_match(&[], 0.0).is_none());
    }

    #[test]
    fn threshold_monotonicity() {
        let scores = vec![score(1, "a", 0.61), score(2, "b", 0.3)];
        let thresholds = [0.0, 0.1, 0.3, 0.5, 0.6, 0.61, 0.62, 0.9, 1.0];
        for (i, hi) in thresholds.iter().enumerate() {
            if matches!(decide(&scores, *hi, None), Decision::Accepted(_)) {
                for lo in &thresholds[..i] {
                    assert!(matches!(decide(&scores, *lo, None), Decision::Accepted(_)));
                }
            }
        }
    }

    #[test]
    fn theme_filter_records_would_match() {
        let scores = vec![score(1, "Energy", 0.9), score(2, "Rates", 0.6)];
        assert_eq!(
            decide(&scores, 0.5, Some("rates")),
            Decision::Filtered {
                would_match: "Energy".into()
            }
        );
        assert!(matches!(
            decide(&scores, 0.5, Some("energy")),
            Decision::Accepted(_)
        ));
        assert_eq!(decide(&scores, 0.95, Some("rates")), Decision::BelowThreshold);
    }
}
