//! Persistence store seam.
//!
//! The pipeline only talks to `Store`; `MemoryStore` is the bundled
//! implementation (with JSON snapshots so validators survive restarts).

pub mod memory;

pub use memory::MemoryStore;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::ingest::FeedItem;
use crate::model::{
    Article, ArticleId, CandidateId, CandidateItem, Citation, Digest, DigestId, NewSource,
    NewTheme, Source, SourceId, Theme, ThemeId, Validators,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(CandidateId),
    /// `(source_id, link)` already known.
    Duplicate,
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    // --- sources ---
    async fn add_source(&self, source: NewSource) -> Result<SourceId>;
    async fn get_source(&self, id: SourceId) -> Result<Option<Source>>;
    async fn list_sources(&self, active_only: bool) -> Result<Vec<Source>>;
    /// Stores validators verbatim and resets the error count.
    async fn record_fetch_success(&self, id: SourceId, validators: Option<Validators>)
        -> Result<()>;
    async fn record_fetch_failure(&self, id: SourceId, error: &str) -> Result<()>;

    // --- candidates ---
    async fn insert_candidate(&self, source_id: SourceId, item: &FeedItem)
        -> Result<InsertOutcome>;
    async fn list_unprocessed(&self, limit: usize) -> Result<Vec<CandidateItem>>;
    /// Returns false if the candidate was already processed (or unknown).
    async fn mark_processed(&self, id: CandidateId) -> Result<bool>;

    // --- articles ---
    async fn insert_article(&self, article: Article) -> Result<ArticleId>;
    async fn get_article(&self, id: ArticleId) -> Result<Option<Article>>;
    async fn update_article(&self, article: &Article) -> Result<()>;
    async fn list_articles_since(&self, since: DateTime<Utc>) -> Result<Vec<Article>>;

    // --- themes ---
    async fn add_theme(&self, theme: NewTheme) -> Result<ThemeId>;
    async fn list_themes(&self, enabled_only: bool) -> Result<Vec<Theme>>;

    // --- digests ---
    async fn insert_digest(&self, digest: Digest) -> Result<DigestId>;
    async fn get_digest(&self, id: DigestId) -> Result<Option<Digest>>;
    async fn list_digests(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Digest>>;

    // --- citations ---
    async fn insert_citations(&self, digest_id: DigestId, citations: &[Citation]) -> Result<()>;
    async fn list_citations(&self, digest_id: DigestId) -> Result<Vec<Citation>>;
}
