// src/ingest/http.rs
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{header, StatusCode};

use super::types::{FeedItem, FetchOutcome, Fetcher};
use super::{clean_html_document, feed::parse_feed};
use crate::model::{SourceKind, Validators};

const USER_AGENT: &str = "news-digest/0.1 (+batch feed aggregator)";

/// Fetches feeds and pages over HTTP with conditional requests.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(5))
            .timeout(request_timeout)
            .build()
            .context("building http client")?;
        Ok(Self { client })
    }

    fn conditional_get(&self, url: &str, validators: &Validators) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(etag) = &validators.etag {
            req = req.header(header::IF_NONE_MATCH, etag);
        }
        if let Some(lm) = &validators.last_modified {
            req = req.header(header::IF_MODIFIED_SINCE, lm);
        }
        req
    }
}

fn header_string(headers: &header::HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn page_title(html: &str) -> Option<String> {
    static RE: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());
    re.captures(html)
        .and_then(|c| c.get(1))
        .map(|m| super::normalize_text(m.as_str()))
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        kind: SourceKind,
        validators: &Validators,
    ) -> Result<FetchOutcome> {
        let resp = self
            .conditional_get(url, validators)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = resp.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            bail!("GET {url} returned {status}");
        }

        let next = Validators {
            etag: header_string(resp.headers(), header::ETAG),
            last_modified: header_string(resp.headers(), header::LAST_MODIFIED),
        };
        let body = resp.text().await.context("reading response body")?;

        let items = match kind {
            SourceKind::Feed => parse_feed(&body)?,
            SourceKind::ManualUrl => {
                let text = clean_html_document(&body);
                vec![FeedItem {
                    link: url.to_string(),
                    title: page_title(&body).unwrap_or_else(|| url.to_string()),
                    description: super::lead_sentences(&text, 2, 320),
                    published_at: None,
                }]
            }
        };

        Ok(FetchOutcome::Fetched {
            items,
            validators: next,
        })
    }

    async fn fetch_article_body(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url} non-2xx"))?;
        let html = resp.text().await.context("reading article body")?;
        let text = clean_html_document(&html);
        if text.is_empty() {
            bail!("article {url} has no readable text");
        }
        Ok(text)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
