// src/ingest/mod.rs
pub mod aggregate;
pub mod feed;
pub mod http;
pub mod types;

pub use aggregate::{AggregateOptions, AggregateResult, Aggregator, SourceError};
pub use http::HttpFetcher;
pub use types::{FeedItem, FetchOutcome, Fetcher};

use once_cell::sync::OnceCell;
use regex::Regex;

/// Max length of normalized item text (titles, descriptions).
pub const MAX_ITEM_CHARS: usize = 1500;
/// Max length of a cleaned article body.
pub const MAX_BODY_CHARS: usize = 20_000;

fn re_tags() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap())
}

fn re_ws() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// Normalize text: decode entities, strip tags, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    clean(s, MAX_ITEM_CHARS)
}

fn clean(s: &str, cap: usize) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    out = re_tags().replace_all(&out, " ").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    out = re_ws().replace_all(&out, " ").trim().to_string();

    // 5) Length cap
    if out.chars().count() > cap {
        out = out.chars().take(cap).collect();
    }
    out
}

/// Turn a whole HTML document into readable text. Drops script/style/nav blocks first.
pub fn clean_html_document(html: &str) -> String {
    static RE_BLOCKS: OnceCell<Regex> = OnceCell::new();
    let re_blocks = RE_BLOCKS.get_or_init(|| {
        Regex::new(r"(?is)<(script|style|noscript|nav|header|footer|aside)\b[^>]*>.*?</(script|style|noscript|nav|header|footer|aside)>")
            .unwrap()
    });
    let stripped = re_blocks.replace_all(html, " ");
    clean(&stripped, MAX_BODY_CHARS)
}

/// Stable content fingerprint (hex SHA-256 prefix) used for cache keys.
pub fn content_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(32);
    for b in digest.iter().take(16) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// First `n` sentences of `text`, capped at `max_chars`.
pub fn lead_sentences(text: &str, n: usize, max_chars: usize) -> String {
    let mut out = String::new();
    let mut taken = 0;
    for piece in text.split_inclusive(['.', '!', '?']) {
        if taken >= n {
            break;
        }
        out.push_str(piece);
        taken += 1;
    }
    let mut out = out.trim().to_string();
    if out.chars().count() > max_chars {
        out = out.chars().take(max_chars).collect::<String>().trim_end().to_string();
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_collapses_ws_and_entities() {
        let s = "  Hello,&nbsp;&nbsp; <b>world</b>!  ";
        assert_eq!(normalize_text(s), "Hello, world !");
    }

    #[test]
    fn document_cleaning_drops_scripts() {
        let html = "<html><head><script>var x = 1;</script><style>p{}</style></head>\
                    <body><nav>Menu</nav><p>Rates rose 0.25%.</p></body></html>";
        assert_eq!(clean_html_document(html), "Rates rose 0.25%.");
    }

    #[test]
    fn content_hash_is_stable_and_sensitive() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("abc").len(), 32);
    }

    #[test]
    fn lead_sentences_takes_prefix() {
        let t = "One. Two! Three? Four.";
        assert_eq!(lead_sentences(t, 2, 100), "One. Two!");
        assert_eq!(lead_sentences(t, 10, 5), "One.…");
    }
}
