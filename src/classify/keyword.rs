//! Deterministic keyword classifier.
//!
//! Per theme: weighted keyword hits (title x2, body x1), squashed to [0, 1]
//! with `1 - exp(-hits / saturation)`.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;

use super::{Classifier, ThemeScore};
use crate::model::{Article, Theme};

pub const TITLE_WEIGHT: f32 = 2.0;
pub const TEXT_WEIGHT: f32 = 1.0;
pub const DEFAULT_SATURATION: f32 = 3.0;

pub struct KeywordClassifier {
    saturation: f32,
    compiled: RwLock<HashMap<String, Regex>>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_SATURATION)
    }
}

/// Word-boundary, case-insensitive pattern; inner spaces match any whitespace.
fn keyword_pattern(keyword: &str) -> String {
    let parts: Vec<String> = keyword.split_whitespace().map(regex::escape).collect();
    format!(r"(?i)\b{}\b", parts.join(r"\s+"))
}

impl KeywordClassifier {
    pub fn new(saturation: f32) -> Self {
        Self {
            saturation: if saturation > 0.0 {
                saturation
            } else {
                DEFAULT_SATURATION
            },
            compiled: RwLock::new(HashMap::new()),
        }
    }

    fn regex_for(&self, keyword: &str) -> Result<Regex> {
        if let Ok(map) = self.compiled.read() {
            if let Some(re) = map.get(keyword) {
                return Ok(re.clone());
            }
        }
        let re = Regex::new(&keyword_pattern(keyword))?;
        if let Ok(mut map) = self.compiled.write() {
            map.insert(keyword.to_string(), re.clone());
        }
        Ok(re)
    }

    /// Score one theme synchronously.
    pub fn score_theme(&self, article: &Article, theme: &Theme) -> Result<ThemeScore> {
        let fallback = [theme.name.clone()];
        let keywords: &[String] = if theme.keywords.is_empty() {
            &fallback
        } else {
            &theme.keywords
        };

        let mut hits = 0.0f32;
        let mut matched = Vec::new();
        for kw in keywords.iter().filter(|k| !k.trim().is_empty()) {
            let re = self.regex_for(kw)?;
            let in_title = re.find_iter(&article.title).count() as f32;
            let in_text = re.find_iter(&article.text).count() as f32;
            if in_title + in_text > 0.0 {
                matched.push(kw.as_str());
            }
            hits += TITLE_WEIGHT * in_title + TEXT_WEIGHT * in_text;
        }

        let score = 1.0 - (-hits / self.saturation).exp();
        let reasoning = if matched.is_empty() {
            "no keyword matches".to_string()
        } else {
            format!("matched: {}", matched.join(", "))
        };
        Ok(ThemeScore {
            theme_id: theme.id,
            theme_name: theme.name.clone(),
            score: score.clamp(0.0, 1.0),
            reasoning,
        })
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn score(&self, article: &Article, themes: &[Theme]) -> Result<Vec<ThemeScore>> {
        themes.iter().map(|t| self.score_theme(article, t)).collect()
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}
