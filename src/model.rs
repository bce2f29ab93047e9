//! Entities shared by every pipeline stage.
//!
//! Ownership of mutation: the aggregator owns `Source`/`CandidateItem`, the
//! classifier creates `Article`s, the clusterer assigns cluster labels and the
//! synthesizer creates `Digest`s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type SourceId = i64;
pub type CandidateId = i64;
pub type ArticleId = i64;
pub type ThemeId = i64;
pub type DigestId = i64;

/// Conditional-request tokens, round-tripped verbatim between passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Feed,
    /// A single page registered by hand; fetched as one item.
    ManualUrl,
}

/// A registered feed or manual URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub kind: SourceKind,
    pub active: bool,
    #[serde(default)]
    pub validators: Validators,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_fetched_at: Option<DateTime<Utc>>,
}

/// Registration payload; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSource {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Raw discovered item before classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateItem {
    pub id: CandidateId,
    pub source_id: SourceId,
    pub link: String,
    pub title: String,
    pub description: String,
    pub published_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
    pub processed: bool,
}

/// A classified article. Optional fields stay `None` until the owning stage fills them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: ArticleId,
    pub candidate_id: Option<CandidateId>,
    pub url: String,
    pub title: String,
    pub text: String,
    pub content_type: String,
    /// Fingerprint of `text`; keys the summary cache and guards the embedding.
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub theme_id: Option<ThemeId>,
    pub relevance: Option<f32>,
    pub summary: Option<String>,
    embedding: Option<Vec<f32>>,
    /// Content hash the embedding was computed from.
    embedding_hash: Option<String>,
    pub cluster_label: Option<String>,
}

impl Article {
    pub fn new(url: impl Into<String>, title: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            id: 0,
            candidate_id: None,
            url: url.into(),
            title: title.into(),
            content_hash: crate::ingest::content_hash(&text),
            text,
            content_type: "text/plain".to_string(),
            fetched_at: Utc::now(),
            published_at: None,
            theme_id: None,
            relevance: None,
            summary: None,
            embedding: None,
            embedding_hash: None,
            cluster_label: None,
        }
    }

    pub fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }

    /// True when there is no embedding or the text changed since it was computed.
    pub fn needs_embedding(&self) -> bool {
        self.embedding.is_none() || self.embedding_hash.as_deref() != Some(&self.content_hash)
    }

    /// Stores the embedding unless a current one already exists. Returns whether it was written.
    pub fn set_embedding(&mut self, vector: Vec<f32>) -> bool {
        if !self.needs_embedding() {
            return false;
        }
        self.embedding = Some(vector);
        self.embedding_hash = Some(self.content_hash.clone());
        true
    }

    /// Replaces the text and refreshes the fingerprint; the embedding becomes stale.
    pub fn replace_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.content_hash = crate::ingest::content_hash(&self.text);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theme {
    pub id: ThemeId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTheme {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNarrative {
    pub title: String,
    pub body: String,
}

/// One clustering run's group. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicCluster {
    pub label: String,
    pub article_ids: Vec<ArticleId>,
    pub narrative: Option<ClusterNarrative>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMoment {
    pub text: String,
    #[serde(default)]
    pub quote: Option<String>,
    /// 1-based index into `Digest::citations`.
    pub citation: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Supporting,
    Opposing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Perspective {
    pub stance: Stance,
    pub summary: String,
    #[serde(default)]
    pub citations: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannableSections {
    #[serde(default)]
    pub top_developments: Vec<String>,
    #[serde(default)]
    pub by_the_numbers: Vec<String>,
    #[serde(default)]
    pub why_it_matters: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleGroup {
    pub label: String,
    pub article_ids: Vec<ArticleId>,
    #[serde(default)]
    pub narrative: Option<ClusterNarrative>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    /// 1-based, as rendered in `[n]` markers.
    pub index: usize,
    pub article_id: ArticleId,
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratedBy {
    Llm,
    Template,
}

/// Digest content as produced by a generator or the template fallback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DigestDraft {
    pub title: String,
    pub tldr: String,
    #[serde(default)]
    pub key_moments: Vec<KeyMoment>,
    #[serde(default)]
    pub perspectives: Vec<Perspective>,
    pub executive_summary: String,
    #[serde(default)]
    pub sections: Option<ScannableSections>,
}

/// Finished digest. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub id: DigestId,
    pub title: String,
    pub tldr: String,
    pub key_moments: Vec<KeyMoment>,
    pub perspectives: Vec<Perspective>,
    pub executive_summary: String,
    pub sections: Option<ScannableSections>,
    pub article_groups: Vec<ArticleGroup>,
    pub citations: Vec<Citation>,
    pub cluster_id: Option<String>,
    pub processed_date: DateTime<Utc>,
    article_count: usize,
    pub generated_by: GeneratedBy,
    pub critique_rounds: u32,
}

impl Digest {
    /// Builds a digest; `article_count` is always the sum of group sizes.
    pub fn new(
        draft: DigestDraft,
        article_groups: Vec<ArticleGroup>,
        citations: Vec<Citation>,
        generated_by: GeneratedBy,
        critique_rounds: u32,
    ) -> Self {
        let article_count = article_groups.iter().map(|g| g.article_ids.len()).sum();
        Self {
            id: 0,
            title: draft.title,
            tldr: draft.tldr,
            key_moments: draft.key_moments,
            perspectives: draft.perspectives,
            executive_summary: draft.executive_summary,
            sections: draft.sections,
            article_groups,
            citations,
            cluster_id: None,
            processed_date: Utc::now(),
            article_count,
            generated_by,
            critique_rounds,
        }
    }

    pub fn article_count(&self) -> usize {
        self.article_count
    }

    pub fn citation_for(&self, article_id: ArticleId) -> Option<usize> {
        self.citations
            .iter()
            .find(|c| c.article_id == article_id)
            .map(|c| c.index)
    }

    /// Prose written by the unified synthesis, in reading order. Stage-1
    /// narratives are left out; see [`Digest::narrative_text`].
    pub fn body_text(&self) -> String {
        let mut parts: Vec<&str> = vec![&self.title, &self.tldr];
        for m in &self.key_moments {
            parts.push(&m.text);
            if let Some(q) = &m.quote {
                parts.push(q);
            }
        }
        for p in &self.perspectives {
            parts.push(&p.summary);
        }
        parts.push(&self.executive_summary);
        if let Some(s) = &self.sections {
            parts.extend(s.top_developments.iter().map(String::as_str));
            parts.extend(s.by_the_numbers.iter().map(String::as_str));
            if let Some(w) = &s.why_it_matters {
                parts.push(w);
            }
        }
        parts.retain(|p| !p.trim().is_empty());
        parts.join("\n")
    }

    /// Per-group narrative bodies.
    pub fn narrative_text(&self) -> String {
        self.article_groups
            .iter()
            .filter_map(|g| g.narrative.as_ref())
            .map(|n| n.body.as_str())
            .filter(|b| !b.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Cached payload with its write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: String,
    pub stored_at: DateTime<Utc>,
}
