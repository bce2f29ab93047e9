//! Classifier backed by the text-generation collaborator.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{Classifier, ThemeScore};
use crate::generate::Generator;
use crate::ingest::lead_sentences;
use crate::model::{Article, Theme};

const MAX_PROMPT_TEXT: usize = 2000;

#[derive(Deserialize)]
struct Reply {
    #[serde(default)]
    scores: Vec<ReplyScore>,
}

#[derive(Deserialize)]
struct ReplyScore {
    theme: String,
    score: f32,
    #[serde(default)]
    reasoning: String,
}

pub struct LlmClassifier {
    generator: Arc<dyn Generator>,
}

impl LlmClassifier {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }

    fn prompt(article: &Article, themes: &[Theme]) -> String {
        let mut p = String::from(
            "Rate how relevant the article is to each theme on a 0.0-1.0 scale.\nThemes:\n",
        );
        for t in themes {
            p.push_str(&format!("- {}: {}\n", t.name, t.description));
        }
        p.push_str(&format!(
            "\nTitle: {}\nText: {}\n",
            article.title,
            lead_sentences(&article.text, 12, MAX_PROMPT_TEXT)
        ));
        p
    }
}

fn schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "scores": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "theme": {"type": "string"},
                        "score": {"type": "number"},
                        "reasoning": {"type": "string"}
                    },
                    "required": ["theme", "score"]
                }
            }
        },
        "required": ["scores"]
    })
}

/// Map a reply onto known themes. Unknown names are ignored, unscored themes get 0.
fn scores_from_reply(reply: Reply, themes: &[Theme]) -> Vec<ThemeScore> {
    themes
        .iter()
        .map(|t| {
            let hit = reply
                .scores
                .iter()
                .find(|s| s.theme.trim().eq_ignore_ascii_case(t.name.trim()));
            match hit {
                Some(s) if s.score.is_finite() => ThemeScore {
                    theme_id: t.id,
                    theme_name: t.name.clone(),
                    score: s.score.clamp(0.0, 1.0),
                    reasoning: s.reasoning.clone(),
                },
                _ => ThemeScore {
                    theme_id: t.id,
                    theme_name: t.name.clone(),
                    score: 0.0,
                    reasoning: "not scored".to_string(),
                },
            }
        })
        .collect()
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn score(&self, article: &Article, themes: &[Theme]) -> Result<Vec<ThemeScore>> {
        let value = self
            .generator
            .generate_json(&Self::prompt(article, themes), &schema())
            .await
            .context("classifier generation")?;
        let reply: Reply = serde_json::from_value(value).context("classifier reply shape")?;
        Ok(scores_from_reply(reply, themes))
    }

    fn name(&self) -> &'static str {
        "llm"
    }
}
