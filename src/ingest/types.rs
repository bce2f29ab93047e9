// src/ingest/types.rs
use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::model::{SourceKind, Validators};

/// One item as discovered in a feed, before it becomes a `CandidateItem`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FeedItem {
    pub link: String,
    pub title: String,
    pub description: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Validators matched; nothing new upstream.
    NotModified,
    Fetched {
        items: Vec<FeedItem>,
        /// Tokens to store for the next conditional request.
        validators: Validators,
    },
}

/// Conditional retrieval of feeds and article bodies.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, kind: SourceKind, validators: &Validators)
        -> Result<FetchOutcome>;

    /// Fetch a page and return its cleaned text.
    async fn fetch_article_body(&self, url: &str) -> Result<String>;

    fn name(&self) -> &'static str;
}
