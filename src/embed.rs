//! Embedder adapter: text → vector, plus the pass that fills article embeddings.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AiConfig;
use crate::ingest::lead_sentences;
use crate::model::{Article, ArticleId};

const EMBED_CONCURRENCY: usize = 4;
const MAX_EMBED_CHARS: usize = 4000;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn dimensions(&self) -> usize;
    fn name(&self) -> &'static str;
}

pub fn build_embedder(config: &AiConfig) -> Result<Arc<dyn Embedder>> {
    if config.enabled() && config.provider_name() == "openai" {
        return Ok(Arc::new(OpenAiEmbedder::from_config(config)?));
    }
    Ok(Arc::new(HashingEmbedder::new(config.embedding_dims)))
}

static RE_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?u)\b\w\w+\b").unwrap());

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "that", "with", "this", "from", "are", "was", "were", "has", "have",
    "had", "its", "his", "her", "their", "they", "will", "would", "said", "says", "into", "over",
    "after", "than", "but", "not", "been", "also", "about", "more", "new", "on", "in", "of", "to",
    "at", "by", "as", "is", "it", "an", "be", "or", "we",
];

/// Deterministic signed feature hashing. Works offline; used in tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        use sha2::{Digest, Sha256};
        let mut v = vec![0.0f32; self.dims];
        let lower = text.to_lowercase();
        for tok in RE_TOKEN.find_iter(&lower) {
            let tok = tok.as_str();
            if STOPWORDS.contains(&tok) {
                continue;
            }
            let h = Sha256::digest(tok.as_bytes());
            let mut b = [0u8; 8];
            b.copy_from_slice(&h[..8]);
            let bucket = (u64::from_le_bytes(b) % self.dims as u64) as usize;
            let sign = if h[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        normalize(&mut v);
        v
    }
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn name(&self) -> &'static str {
        "hashing"
    }
}

/// OpenAI `/v1/embeddings`.
pub struct OpenAiEmbedder {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    dims: usize,
}

#[derive(Serialize)]
struct EmbedReq<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbedResp {
    data: Vec<EmbedDatum>,
}

#[derive(Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn from_config(config: &AiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("news-digest/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            http,
            api_key: config.resolve_api_key()?,
            model: config.embedding_model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            dims: config.embedding_dims,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let req = EmbedReq {
            model: &self.model,
            input: text,
            dimensions: self.dims,
        };
        let resp = self
            .http
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("openai: sending embeddings request")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("openai: embeddings returned {status}");
        }
        let body: EmbedResp = resp.json().await.context("openai: decoding embeddings")?;
        match body.data.into_iter().next() {
            Some(d) if !d.embedding.is_empty() => Ok(d.embedding),
            _ => bail!("openai: empty embedding"),
        }
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedFailure {
    pub article_id: ArticleId,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmbedReport {
    pub embedded: usize,
    /// Already had a current embedding.
    pub reused: usize,
    pub failures: Vec<EmbedFailure>,
}

/// Text an article is embedded from: title plus summary (or leading body text).
pub fn embedding_input(article: &Article) -> String {
    let body = match &article.summary {
        Some(s) if !s.trim().is_empty() => s.clone(),
        _ => lead_sentences(&article.text, 20, MAX_EMBED_CHARS),
    };
    format!("{}\n{}", article.title, body)
}

/// Embed every article that lacks a current embedding. Failed articles keep
/// no embedding and are listed in the report.
pub async fn embed_articles(articles: &mut [Article], embedder: &dyn Embedder) -> EmbedReport {
    let mut report = EmbedReport::default();
    let todo: Vec<(usize, String)> = articles
        .iter()
        .enumerate()
        .filter(|(_, a)| a.needs_embedding())
        .map(|(i, a)| (i, embedding_input(a)))
        .collect();
    report.reused = articles.len() - todo.len();

    let results: Vec<(usize, Result<Vec<f32>>)> = stream::iter(todo)
        .map(|(i, text)| async move { (i, embedder.embed(&text).await) })
        .buffered(EMBED_CONCURRENCY)
        .collect()
        .await;

    for (i, res) in results {
        let article = &mut articles[i];
        match res {
            Ok(v) if v.iter().all(|x| x.is_finite()) => {
                article.set_embedding(v);
                report.embedded += 1;
            }
            Ok(_) => report.failures.push(EmbedFailure {
                article_id: article.id,
                message: "embedding contains non-finite values".into(),
            }),
            Err(e) => {
                warn!(article_id = article.id, error = %e, "embedding failed");
                report.failures.push(EmbedFailure {
                    article_id: article.id,
                    message: format!("{e:#}"),
                });
            }
        }
    }
    debug!(
        embedded = report.embedded,
        reused = report.reused,
        failed = report.failures.len(),
        "embedding pass finished"
    );
    report
}
