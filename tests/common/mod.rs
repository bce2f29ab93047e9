// tests/common/mod.rs
// Scripted collaborators shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use news_digest::generate::{GenerateOptions, Generator};
use news_digest::ingest::{FeedItem, FetchOutcome, Fetcher};
use news_digest::model::{NewSource, NewTheme, SourceKind, Validators};

pub enum Script {
    /// Serves `items`; answers NotModified once the caller echoes `etag`.
    Feed { items: Vec<FeedItem>, etag: String },
    Fail(String),
    /// Sleeps, then reports NotModified.
    Slow(Duration),
}

#[derive(Default)]
pub struct ScriptedFetcher {
    feeds: HashMap<String, Script>,
    bodies: HashMap<String, String>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feed(mut self, url: &str, script: Script) -> Self {
        self.feeds.insert(url.to_string(), script);
        self
    }

    pub fn with_body(mut self, url: &str, body: &str) -> Self {
        self.bodies.insert(url.to_string(), body.to_string());
        self
    }

    pub fn feed_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        url: &str,
        _kind: SourceKind,
        validators: &Validators,
    ) -> Result<FetchOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.feeds.get(url) {
            Some(Script::Feed { items, etag }) => {
                if validators.etag.as_deref() == Some(etag.as_str()) {
                    return Ok(FetchOutcome::NotModified);
                }
                Ok(FetchOutcome::Fetched {
                    items: items.clone(),
                    validators: Validators {
                        etag: Some(etag.clone()),
                        last_modified: None,
                    },
                })
            }
            Some(Script::Fail(msg)) => bail!("{msg}"),
            Some(Script::Slow(d)) => {
                tokio::time::sleep(*d).await;
                Ok(FetchOutcome::NotModified)
            }
            None => bail!("no script for {url}"),
        }
    }

    async fn fetch_article_body(&self, url: &str) -> Result<String> {
        self.bodies
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("no body for {url}"))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Sleeps `delay` in every call and records the highest number of calls in flight.
/// Feeds answer NotModified; article bodies echo the URL.
pub struct InFlightFetcher {
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl InFlightFetcher {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn hold(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetcher for InFlightFetcher {
    async fn fetch(
        &self,
        _url: &str,
        _kind: SourceKind,
        _validators: &Validators,
    ) -> Result<FetchOutcome> {
        self.hold().await;
        Ok(FetchOutcome::NotModified)
    }

    async fn fetch_article_body(&self, url: &str) -> Result<String> {
        self.hold().await;
        Ok(format!("Body of {url} about rates."))
    }

    fn name(&self) -> &'static str {
        "in-flight"
    }
}

static RE_TABLE_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\[(\d+)\] ").unwrap());

/// Indices listed as `[n] ...` lines in a prompt.
pub fn listed_indices(prompt: &str) -> Vec<usize> {
    RE_TABLE_LINE
        .captures_iter(prompt)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

fn markers(indices: &[usize]) -> String {
    indices
        .iter()
        .map(|n| format!("[{n}]"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Answers by schema shape: summaries, narratives and digests cite everything listed;
/// critiques come back clean.
pub struct ScriptedGenerator;

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, _prompt: &str, _opts: &GenerateOptions) -> Result<String> {
        Ok("Officials reported 3 changes on 12 May 2025.".to_string())
    }

    async fn generate_json(&self, prompt: &str, schema: &Value) -> Result<Value> {
        let props = &schema["properties"];
        if props.get("issues").is_some() {
            return Ok(json!({ "issues": [] }));
        }
        let cited = listed_indices(prompt);
        if props.get("executive_summary").is_some() {
            let first = cited.first().copied().unwrap_or(1);
            return Ok(json!({
                "title": "Rates, oil and chips on 12 May 2025",
                "tldr": format!("{} stories across 3 markets.", cited.len()),
                "key_moments": [{ "text": "The Federal Reserve held at 5.25%.", "citation": first }],
                "perspectives": [],
                "executive_summary": format!(
                    "Central banks held rates at 5.25% while Brent rose to $91 and TSMC lifted capex to $40 billion {}.",
                    markers(&cited)
                ),
                "sections": {
                    "top_developments": ["Fed holds at 5.25%", "Brent at $91"],
                    "by_the_numbers": ["$40 billion capex"]
                }
            }));
        }
        Ok(json!({
            "title": "Topic update",
            "body": format!("On 12 May 2025 these reports moved markets by 2% {}.", markers(&cited)),
        }))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

pub fn feed_item(link: &str, title: &str, published_at: DateTime<Utc>) -> FeedItem {
    FeedItem {
        link: link.to_string(),
        title: title.to_string(),
        description: title.to_string(),
        published_at: Some(published_at),
    }
}

pub fn source(name: &str, url: &str) -> NewSource {
    NewSource {
        name: name.to_string(),
        url: url.to_string(),
        kind: SourceKind::Feed,
        active: true,
    }
}

pub fn theme(name: &str, keywords: &[&str]) -> NewTheme {
    NewTheme {
        name: name.to_string(),
        description: String::new(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        enabled: true,
    }
}

pub fn default_themes() -> Vec<NewTheme> {
    vec![
        theme(
            "Monetary policy",
            &["interest rate", "rates", "inflation", "central bank", "federal reserve", "ecb", "monetary policy"],
        ),
        theme("Energy", &["oil", "gas", "opec", "crude", "energy", "electricity"]),
        theme("Technology", &["ai", "chip", "semiconductor", "software", "cloud", "startup"]),
    ]
}

/// (feed url, [(link, title, body)]) for three topics of four stories each.
pub fn topic_fixture() -> Vec<(&'static str, Vec<(&'static str, &'static str, &'static str)>)> {
    vec![
        (
            "https://feeds.test/monetary.xml",
            vec![
                (
                    "https://news.test/m1",
                    "Federal Reserve holds interest rates at 5.25%",
                    "The Federal Reserve kept rates unchanged. Officials said inflation is easing but rates stay high for now.",
                ),
                (
                    "https://news.test/m2",
                    "ECB signals inflation fight is not over",
                    "The ECB said inflation in the euro area remains sticky. The central bank may keep rates elevated.",
                ),
                (
                    "https://news.test/m3",
                    "Bank of England monetary policy committee splits on rates",
                    "The monetary policy committee voted 5-4 to hold rates. Inflation expectations were the main concern.",
                ),
                (
                    "https://news.test/m4",
                    "Central bank governors warn on sticky inflation",
                    "Central bank governors meeting in Basel warned that inflation could force rates higher again.",
                ),
            ],
        ),
        (
            "https://feeds.test/energy.xml",
            vec![
                (
                    "https://news.test/e1",
                    "OPEC extends crude oil output cuts into 2026",
                    "OPEC members agreed to extend crude oil output cuts. Oil traders expect tighter supply.",
                ),
                (
                    "https://news.test/e2",
                    "Brent crude climbs to $91 as oil inventories fall",
                    "Brent crude rose for a fifth day. Oil inventories in Cushing fell to a two-year low.",
                ),
                (
                    "https://news.test/e3",
                    "European gas prices jump after pipeline outage",
                    "Gas prices in Europe jumped 12% after a Norwegian pipeline outage. Energy traders scrambled for cargoes.",
                ),
                (
                    "https://news.test/e4",
                    "Electricity demand lifts energy stocks in Texas",
                    "Record electricity demand in Texas lifted energy stocks. Power prices hit a summer high.",
                ),
            ],
        ),
        (
            "https://feeds.test/tech.xml",
            vec![
                (
                    "https://news.test/t1",
                    "Nvidia unveils new AI chip for data centers",
                    "Nvidia showed a new AI chip aimed at training large models. The chip ships next year.",
                ),
                (
                    "https://news.test/t2",
                    "TSMC raises semiconductor capex to $40 billion",
                    "TSMC lifted its semiconductor spending plan. The chip maker cited strong AI orders.",
                ),
                (
                    "https://news.test/t3",
                    "Cloud software spending slows at large firms",
                    "Surveys show cloud software budgets growing more slowly. Software vendors trimmed guidance.",
                ),
                (
                    "https://news.test/t4",
                    "AI startup raises $2 billion in funding round",
                    "An AI startup closed a $2 billion round. The startup builds software for coding assistants.",
                ),
            ],
        ),
    ]
}

/// Fetcher serving [`topic_fixture`] with items published `age` ago.
pub fn topic_fetcher(now: DateTime<Utc>, age: chrono::Duration) -> ScriptedFetcher {
    let mut fetcher = ScriptedFetcher::new();
    for (i, (feed, stories)) in topic_fixture().into_iter().enumerate() {
        let items = stories
            .iter()
            .map(|(link, title, _)| feed_item(link, title, now - age))
            .collect();
        fetcher = fetcher.with_feed(
            feed,
            Script::Feed {
                items,
                etag: format!("\"v{i}\""),
            },
        );
        for (link, _, body) in stories {
            fetcher = fetcher.with_body(link, body);
        }
    }
    fetcher
}

pub fn topic_sources() -> Vec<NewSource> {
    topic_fixture()
        .iter()
        .map(|(feed, _)| source(feed, feed))
        .collect()
}
