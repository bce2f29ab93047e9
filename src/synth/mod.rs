//! Narrative synthesizer.
//!
//! Three levels: per-article summaries, per-cluster narratives (stage 1) and
//! one unified digest (stage 2) that goes through the critique-refine loop.
//! Every level has a deterministic fallback, so synthesis always yields a digest.

pub mod refine;
pub mod template;

pub use refine::{RefineEvent, RefineMachine, RefineState};
pub use template::{template_digest, template_narrative};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cache::{summary_key, ContentCache, SUMMARY_TTL};
use crate::generate::{GenerateOptions, Generator};
use crate::ingest::{content_hash, lead_sentences};
use crate::metrics::ensure_metrics_described;
use crate::model::{
    Article, ArticleGroup, ArticleId, Citation, ClusterNarrative, Digest, DigestDraft,
    GeneratedBy, TopicCluster,
};
use crate::quality::{evaluate, local_critique, GradeThresholds};

pub const SUMMARY_SENTENCES: usize = 2;
pub const SUMMARY_MAX_CHARS: usize = 320;
const SUMMARY_CONCURRENCY: usize = 4;
const PROMPT_TEXT_CHARS: usize = 3000;

static RE_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s?\[(\d+(?:\s*,\s*\d+)*)\]").unwrap());

#[derive(Debug, Clone)]
pub struct SynthOptions {
    pub critique_rounds: u32,
    pub summary_ttl: Duration,
    pub thresholds: GradeThresholds,
}

impl Default for SynthOptions {
    fn default() -> Self {
        Self {
            critique_rounds: 2,
            summary_ttl: SUMMARY_TTL,
            thresholds: GradeThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SummaryStats {
    pub generated: usize,
    pub cached: usize,
    pub fallback: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Synthesis {
    pub digest: Digest,
    /// Clusters with their stage-1 narratives filled in.
    pub clusters: Vec<TopicCluster>,
    pub narrative_fallbacks: usize,
    pub final_state: RefineState,
}

enum SummarySource {
    Cached,
    Generated,
    Fallback,
}

/// 1-based citation table over articles in cluster order.
pub fn citation_table(clusters: &[TopicCluster], articles: &[Article]) -> Vec<Citation> {
    let by_id: HashMap<ArticleId, &Article> = articles.iter().map(|a| (a.id, a)).collect();
    clusters
        .iter()
        .flat_map(|c| c.article_ids.iter())
        .filter_map(|id| by_id.get(id))
        .enumerate()
        .map(|(i, a)| Citation {
            index: i + 1,
            article_id: a.id,
            url: a.url.clone(),
            title: a.title.clone(),
        })
        .collect()
}

/// Remove `[n]` markers outside `1..=max`; keep valid indices in mixed markers.
pub fn strip_invalid_markers(text: &str, max: usize) -> String {
    RE_MARKER
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let whole = &caps[0];
            let lead = if whole.starts_with(char::is_whitespace) { " " } else { "" };
            let valid: Vec<String> = caps[1]
                .split(',')
                .filter_map(|n| n.trim().parse::<usize>().ok())
                .filter(|n| (1..=max).contains(n))
                .map(|n| n.to_string())
                .collect();
            if valid.is_empty() {
                String::new()
            } else {
                format!("{lead}[{}]", valid.join(", "))
            }
        })
        .into_owned()
}

/// Drop citation references a generated draft made up.
pub fn sanitize_draft(mut draft: DigestDraft, citation_count: usize) -> DigestDraft {
    let ok = |n: &usize| (1..=citation_count).contains(n);
    draft.key_moments.retain(|m| ok(&m.citation));
    for p in &mut draft.perspectives {
        p.citations.retain(ok);
        p.summary = strip_invalid_markers(&p.summary, citation_count);
    }
    for m in &mut draft.key_moments {
        m.text = strip_invalid_markers(&m.text, citation_count);
    }
    draft.title = strip_invalid_markers(&draft.title, citation_count);
    draft.tldr = strip_invalid_markers(&draft.tldr, citation_count);
    draft.executive_summary = strip_invalid_markers(&draft.executive_summary, citation_count);
    if let Some(s) = &mut draft.sections {
        for line in s.top_developments.iter_mut().chain(s.by_the_numbers.iter_mut()) {
            *line = strip_invalid_markers(line, citation_count);
        }
        if let Some(w) = &mut s.why_it_matters {
            *w = strip_invalid_markers(w, citation_count);
        }
    }
    draft
}

fn digest_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "title": {"type": "string"},
            "tldr": {"type": "string"},
            "key_moments": {"type": "array", "items": {"type": "object", "properties": {
                "text": {"type": "string"}, "quote": {"type": "string"}, "citation": {"type": "integer"}
            }, "required": ["text", "citation"]}},
            "perspectives": {"type": "array", "items": {"type": "object", "properties": {
                "stance": {"enum": ["supporting", "opposing"]},
                "summary": {"type": "string"},
                "citations": {"type": "array", "items": {"type": "integer"}}
            }, "required": ["stance", "summary"]}},
            "executive_summary": {"type": "string"},
            "sections": {"type": "object", "properties": {
                "top_developments": {"type": "array", "items": {"type": "string"}},
                "by_the_numbers": {"type": "array", "items": {"type": "string"}},
                "why_it_matters": {"type": "string"}
            }}
        },
        "required": ["title", "tldr", "executive_summary"]
    })
}

fn narrative_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {"title": {"type": "string"}, "body": {"type": "string"}},
        "required": ["title", "body"]
    })
}

fn critique_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {"issues": {"type": "array", "items": {"type": "string"}}},
        "required": ["issues"]
    })
}

#[derive(Deserialize)]
struct CritiqueReply {
    #[serde(default)]
    issues: Vec<String>,
}

fn citation_lines(citations: &[Citation]) -> String {
    citations
        .iter()
        .map(|c| format!("[{}] {} ({})", c.index, c.title, c.url))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct Synthesizer {
    generator: Arc<dyn Generator>,
    cache: Arc<dyn ContentCache>,
    opts: SynthOptions,
}

impl Synthesizer {
    pub fn new(generator: Arc<dyn Generator>, cache: Arc<dyn ContentCache>, opts: SynthOptions) -> Self {
        Self {
            generator,
            cache,
            opts,
        }
    }

    /// Fill `summary` for articles that have none: cache, else generator, else lead sentences.
    pub async fn summarize_articles(&self, articles: &mut [Article]) -> SummaryStats {
        ensure_metrics_described();
        let todo: Vec<(usize, String, String, String)> = articles
            .iter()
            .enumerate()
            .filter(|(_, a)| a.summary.is_none())
            .map(|(i, a)| (i, summary_key(&a.url, &a.content_hash), a.title.clone(), a.text.clone()))
            .collect();

        let results: Vec<(usize, String, SummarySource)> = stream::iter(todo)
            .map(|(i, key, title, text)| async move {
                let (summary, source) = self.summarize_one(&key, &title, &text).await;
                (i, summary, source)
            })
            .buffered(SUMMARY_CONCURRENCY)
            .collect()
            .await;

        let mut stats = SummaryStats::default();
        for (i, summary, source) in results {
            match source {
                SummarySource::Cached => stats.cached += 1,
                SummarySource::Generated => stats.generated += 1,
                SummarySource::Fallback => stats.fallback += 1,
            }
            articles[i].summary = Some(summary);
        }
        debug!(target: "synth", generated = stats.generated, cached = stats.cached, fallback = stats.fallback, "summaries ready");
        stats
    }

    async fn summarize_one(&self, key: &str, title: &str, text: &str) -> (String, SummarySource) {
        if let Some(hit) = self.cache.get(key, self.opts.summary_ttl) {
            return (hit, SummarySource::Cached);
        }
        let opts = GenerateOptions {
            system: Some(
                "Summarize the news article in at most two factual sentences. Keep numbers, names and dates."
                    .into(),
            ),
            temperature: 0.2,
            max_tokens: 160,
        };
        let prompt = format!(
            "Title: {title}\n\n{}",
            lead_sentences(text, 40, PROMPT_TEXT_CHARS)
        );
        match self.generator.generate(&prompt, &opts).await {
            Ok(s) if !s.trim().is_empty() => {
                let s = s.trim().to_string();
                self.cache.put(key, &s);
                (s, SummarySource::Generated)
            }
            Ok(_) | Err(_) => {
                let basis = if text.trim().is_empty() { title } else { text };
                (
                    lead_sentences(basis, SUMMARY_SENTENCES, SUMMARY_MAX_CHARS),
                    SummarySource::Fallback,
                )
            }
        }
    }

    /// Stage 1. Every member is listed in the prompt. Returns the narrative
    /// and whether it was generated.
    pub async fn narrate_cluster(
        &self,
        cluster: &TopicCluster,
        articles: &HashMap<ArticleId, &Article>,
        citations: &[Citation],
    ) -> (ClusterNarrative, GeneratedBy) {
        let index = template::citation_index(citations);
        let mut prompt = format!(
            "Write a short narrative (title + body) about this news topic: {}.\n\
             Cite every article with its [n] marker.\nArticles:\n",
            cluster.label
        );
        for id in &cluster.article_ids {
            let (Some(a), Some(n)) = (articles.get(id), index.get(id)) else {
                continue;
            };
            let summary = a.summary.as_deref().unwrap_or(&a.title);
            prompt.push_str(&format!("[{n}] {} - {summary}\n", a.title));
        }

        let generated = self
            .generator
            .generate_json(&prompt, &narrative_schema())
            .await
            .and_then(|v| serde_json::from_value::<ClusterNarrative>(v).context("narrative reply shape"));
        match generated {
            Ok(mut n) if !n.body.trim().is_empty() => {
                n.body = strip_invalid_markers(&n.body, citations.len());
                n.body = ensure_member_citations(&n.body, cluster, articles, &index);
                if n.title.trim().is_empty() {
                    n.title = cluster.label.clone();
                }
                (n, GeneratedBy::Llm)
            }
            other => {
                if let Err(e) = other {
                    debug!(target: "synth", cluster = %cluster.label, error = %e, "narrative fallback");
                }
                counter!("synth_fallback_total", "stage" => "narrative").increment(1);
                (template_narrative(cluster, articles, citations), GeneratedBy::Template)
            }
        }
    }

    /// Stage 2 plus critique-refine; falls back to the template on any stage-2 failure.
    pub async fn synthesize(&self, mut clusters: Vec<TopicCluster>, articles: &[Article]) -> Synthesis {
        ensure_metrics_described();
        let by_id: HashMap<ArticleId, &Article> = articles.iter().map(|a| (a.id, a)).collect();
        let citations = citation_table(&clusters, articles);

        let mut narrative_fallbacks = 0;
        for c in clusters.iter_mut() {
            let (n, by) = self.narrate_cluster(c, &by_id, &citations).await;
            if by == GeneratedBy::Template {
                narrative_fallbacks += 1;
            }
            c.narrative = Some(n);
        }

        let groups: Vec<ArticleGroup> = clusters
            .iter()
            .map(|c| ArticleGroup {
                label: c.label.clone(),
                article_ids: c.article_ids.clone(),
                narrative: c.narrative.clone(),
            })
            .collect();
        let member_articles: Vec<Article> = clusters
            .iter()
            .flat_map(|c| c.article_ids.iter())
            .filter_map(|id| by_id.get(id).map(|a| (*a).clone()))
            .collect();

        let (digest, final_state) = match self.draft_digest(&clusters, &citations).await {
            Ok(draft) => {
                let (draft, machine) = self
                    .refine_loop(draft, &groups, &citations, &member_articles)
                    .await;
                let rounds = machine.round();
                histogram!("synth_critique_rounds").record(rounds as f64);
                (
                    Digest::new(draft, groups, citations, GeneratedBy::Llm, rounds),
                    machine.state(),
                )
            }
            Err(e) => {
                warn!(target: "synth", error = %e, "digest generation failed; using template");
                counter!("synth_fallback_total", "stage" => "digest").increment(1);
                let draft = template_digest(&clusters, &by_id, &citations);
                (
                    Digest::new(draft, groups, citations, GeneratedBy::Template, 0),
                    RefineState::Done,
                )
            }
        };

        let mut digest = digest;
        let mut ids: Vec<ArticleId> = member_articles.iter().map(|a| a.id).collect();
        ids.sort_unstable();
        digest.cluster_id = Some(content_hash(
            &ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(","),
        ));

        info!(
            target: "synth",
            clusters = clusters.len(),
            articles = digest.article_count(),
            generated_by = ?digest.generated_by,
            critique_rounds = digest.critique_rounds,
            narrative_fallbacks,
            "digest synthesized"
        );
        Synthesis {
            digest,
            clusters,
            narrative_fallbacks,
            final_state,
        }
    }

    async fn draft_digest(&self, clusters: &[TopicCluster], citations: &[Citation]) -> Result<DigestDraft> {
        let mut prompt = String::from(
            "Combine these topic narratives into one news digest. Use [n] markers from the \
             citation table; cite every article at least once. Be concrete: numbers, dates, names.\n\n",
        );
        for c in clusters {
            if let Some(n) = &c.narrative {
                prompt.push_str(&format!("## {}\n{}\n\n", n.title, n.body));
            }
        }
        prompt.push_str("Citation table:\n");
        prompt.push_str(&citation_lines(citations));

        let value = self.generator.generate_json(&prompt, &digest_schema()).await?;
        let draft: DigestDraft = serde_json::from_value(value).context("digest reply shape")?;
        if draft.executive_summary.trim().is_empty() {
            anyhow::bail!("digest reply has an empty executive summary");
        }
        Ok(sanitize_draft(draft, citations.len()))
    }

    async fn refine_loop(
        &self,
        mut draft: DigestDraft,
        groups: &[ArticleGroup],
        citations: &[Citation],
        articles: &[Article],
    ) -> (DigestDraft, RefineMachine) {
        let mut machine = RefineMachine::new(self.opts.critique_rounds);
        machine.handle(RefineEvent::Drafted);

        while !machine.is_terminal() {
            match machine.state() {
                RefineState::Critique => {
                    let issues = self.critique(&draft, groups, citations, articles).await;
                    debug!(target: "synth", round = machine.round(), issues = issues.len(), "critique");
                    machine.handle(RefineEvent::Critiqued { issues });
                }
                RefineState::Refine => {
                    match self.refine(&draft, machine.issues(), citations).await {
                        Ok(next) => {
                            draft = next;
                            machine.handle(RefineEvent::Refined);
                        }
                        Err(e) => {
                            warn!(target: "synth", error = %e, "refine failed; keeping previous draft");
                            machine.handle(RefineEvent::Failed);
                        }
                    }
                }
                _ => break,
            }
        }
        (draft, machine)
    }

    /// Generator critique merged with the local quality critique.
    async fn critique(
        &self,
        draft: &DigestDraft,
        groups: &[ArticleGroup],
        citations: &[Citation],
        articles: &[Article],
    ) -> Vec<String> {
        let probe = Digest::new(
            draft.clone(),
            groups.to_vec(),
            citations.to_vec(),
            GeneratedBy::Llm,
            0,
        );
        let report = evaluate(&probe, articles, &self.opts.thresholds);
        let mut issues = local_critique(&probe, &report, &self.opts.thresholds);

        let prompt = match serde_json::to_string_pretty(draft) {
            Ok(json) => format!(
                "Critique this news digest. List concrete problems only (missing citations, vague wording, \
                 unsupported claims). Return an empty list if it is good.\n\n{json}"
            ),
            Err(_) => return issues,
        };
        match self.generator.generate_json(&prompt, &critique_schema()).await {
            Ok(v) => match serde_json::from_value::<CritiqueReply>(v) {
                Ok(r) => {
                    let mut seen: HashSet<String> = issues.iter().cloned().collect();
                    for i in r.issues.into_iter().filter(|i| !i.trim().is_empty()) {
                        if seen.insert(i.clone()) {
                            issues.push(i);
                        }
                    }
                }
                Err(e) => debug!(target: "synth", error = %e, "critique reply shape"),
            },
            Err(e) => debug!(target: "synth", error = %e, "generator critique unavailable"),
        }
        issues
    }

    async fn refine(&self, draft: &DigestDraft, issues: &[String], citations: &[Citation]) -> Result<DigestDraft> {
        let json = serde_json::to_string_pretty(draft)?;
        let prompt = format!(
            "Revise this news digest to fix the issues. Keep valid [n] citations.\n\nIssues:\n- {}\n\n\
             Citation table:\n{}\n\nDigest:\n{json}",
            issues.join("\n- "),
            citation_lines(citations)
        );
        let value = self.generator.generate_json(&prompt, &digest_schema()).await?;
        let next: DigestDraft = serde_json::from_value(value).context("refine reply shape")?;
        if next.executive_summary.trim().is_empty() {
            anyhow::bail!("refined digest has an empty executive summary");
        }
        Ok(sanitize_draft(next, citations.len()))
    }
}

/// Append citations for members the narrative forgot, so stage 1 covers the whole cluster.
fn ensure_member_citations(
    body: &str,
    cluster: &TopicCluster,
    articles: &HashMap<ArticleId, &Article>,
    index: &HashMap<ArticleId, usize>,
) -> String {
    let present: HashSet<usize> = crate::quality::citation_markers(body).into_iter().collect();
    let missing: Vec<String> = cluster
        .article_ids
        .iter()
        .filter_map(|id| {
            let n = index.get(id)?;
            if present.contains(n) {
                return None;
            }
            let a = articles.get(id)?;
            Some(format!("{} [{n}]", a.title.trim_end_matches('.')))
        })
        .collect();
    if missing.is_empty() {
        body.to_string()
    } else {
        format!("{} Also: {}.", body.trim_end(), missing.join("; "))
    }
}
