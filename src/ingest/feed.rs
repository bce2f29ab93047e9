//! RSS 2.0 and Atom parsing into `FeedItem`s.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{
    format_description::well_known::{Rfc2822, Rfc3339},
    OffsetDateTime,
};

use super::{normalize_text, FeedItem};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entry: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<AtomText>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    published: Option<String>,
    updated: Option<String>,
    summary: Option<AtomText>,
    content: Option<AtomText>,
}

#[derive(Debug, Deserialize)]
struct AtomText {
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: String,
    #[serde(rename = "@rel", default)]
    rel: Option<String>,
}

fn unix_to_utc(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(ts, 0)
}

pub fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    OffsetDateTime::parse(ts, &Rfc2822)
        .ok()
        .or_else(|| {
            // Named zones still common in feeds.
            let numeric = ["GMT", "UTC", "UT", "Z"]
                .iter()
                .find_map(|z| ts.strip_suffix(z))
                .map(|head| format!("{}+0000", head))?;
            OffsetDateTime::parse(&numeric, &Rfc2822).ok()
        })
        .and_then(|dt| unix_to_utc(dt.unix_timestamp()))
}

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    OffsetDateTime::parse(ts.trim(), &Rfc3339)
        .ok()
        .and_then(|dt| unix_to_utc(dt.unix_timestamp()))
}

/// Parse either an RSS or an Atom document.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedItem>> {
    let t0 = std::time::Instant::now();
    let xml_clean = scrub_html_entities_for_xml(xml);

    let items = if looks_like_atom(&xml_clean) {
        parse_atom(&xml_clean)?
    } else {
        parse_rss(&xml_clean)?
    };

    let ms = t0.elapsed().as_secs_f64() * 1_000.0;
    histogram!("ingest_parse_ms").record(ms);
    counter!("ingest_items_parsed_total").increment(items.len() as u64);
    Ok(items)
}

fn looks_like_atom(xml: &str) -> bool {
    match (xml.find("<feed"), xml.find("<rss")) {
        (Some(f), Some(r)) => f < r,
        (Some(_), None) => true,
        _ => false,
    }
}

fn parse_rss(xml: &str) -> Result<Vec<FeedItem>> {
    let rss: Rss = from_str(xml).context("parsing rss xml")?;
    let mut out = Vec::with_capacity(rss.channel.item.len());
    for it in rss.channel.item {
        let Some(link) = it.link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty()) else {
            continue;
        };
        let title = normalize_text(it.title.as_deref().unwrap_or_default());
        let description = normalize_text(it.description.as_deref().unwrap_or_default());
        if title.is_empty() && description.is_empty() {
            continue;
        }
        out.push(FeedItem {
            link,
            title,
            description,
            published_at: it.pub_date.as_deref().and_then(parse_rfc2822),
        });
    }
    Ok(out)
}

fn parse_atom(xml: &str) -> Result<Vec<FeedItem>> {
    let feed: AtomFeed = from_str(xml).context("parsing atom xml")?;
    let mut out = Vec::with_capacity(feed.entry.len());
    for e in feed.entry {
        let link = e
            .links
            .iter()
            .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
            .or_else(|| e.links.first())
            .map(|l| l.href.trim().to_string())
            .filter(|l| !l.is_empty());
        let Some(link) = link else {
            continue;
        };
        let title = normalize_text(e.title.as_ref().map(|t| t.value.as_str()).unwrap_or_default());
        let description = normalize_text(
            e.summary
                .as_ref()
                .or(e.content.as_ref())
                .map(|t| t.value.as_str())
                .unwrap_or_default(),
        );
        if title.is_empty() && description.is_empty() {
            continue;
        }
        let published_at = e
            .published
            .as_deref()
            .or(e.updated.as_deref())
            .and_then(parse_rfc3339);
        out.push(FeedItem {
            link,
            title,
            description,
            published_at,
        });
    }
    Ok(out)
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}
