//! Templated narratives and digests, used whenever generation fails.
//! Built only from titles and counts, and they always cite every article.

use std::collections::HashMap;

use crate::model::{
    Article, ArticleId, Citation, ClusterNarrative, DigestDraft, KeyMoment, ScannableSections,
    TopicCluster,
};

pub(crate) fn citation_index(citations: &[Citation]) -> HashMap<ArticleId, usize> {
    citations.iter().map(|c| (c.article_id, c.index)).collect()
}

fn cited_titles(
    ids: &[ArticleId],
    articles: &HashMap<ArticleId, &Article>,
    index: &HashMap<ArticleId, usize>,
) -> Vec<String> {
    ids.iter()
        .filter_map(|id| {
            let a = articles.get(id)?;
            let n = index.get(id)?;
            Some(format!("{} [{n}]", a.title.trim_end_matches('.')))
        })
        .collect()
}

fn plural(n: usize, one: &str, many: &str) -> String {
    if n == 1 {
        format!("{n} {one}")
    } else {
        format!("{n} {many}")
    }
}

pub fn template_narrative(
    cluster: &TopicCluster,
    articles: &HashMap<ArticleId, &Article>,
    citations: &[Citation],
) -> ClusterNarrative {
    let index = citation_index(citations);
    let titles = cited_titles(&cluster.article_ids, articles, &index);
    ClusterNarrative {
        title: cluster.label.clone(),
        body: format!(
            "{} on {}: {}.",
            plural(cluster.article_ids.len(), "article", "articles"),
            cluster.label,
            titles.join("; ")
        ),
    }
}

/// Digest draft from cluster labels, article titles and counts.
pub fn template_digest(
    clusters: &[TopicCluster],
    articles: &HashMap<ArticleId, &Article>,
    citations: &[Citation],
) -> DigestDraft {
    let index = citation_index(citations);
    let total: usize = clusters.iter().map(|c| c.article_ids.len()).sum();
    let topics = plural(clusters.len(), "topic", "topics");
    let stories = plural(total, "article", "articles");

    let title = match clusters.first() {
        Some(top) => format!("Digest: {}", top.label),
        None => "Digest".to_string(),
    };
    let tldr = match clusters.first() {
        Some(top) => format!(
            "{stories} grouped into {topics}. Largest topic: {} ({}).",
            top.label,
            plural(top.article_ids.len(), "article", "articles")
        ),
        None => format!("{stories} grouped into {topics}."),
    };

    let key_moments = clusters
        .iter()
        .filter_map(|c| {
            let id = c.article_ids.first()?;
            let a = articles.get(id)?;
            Some(KeyMoment {
                text: a.title.clone(),
                quote: None,
                citation: *index.get(id)?,
            })
        })
        .collect();

    let executive_summary = clusters
        .iter()
        .map(|c| {
            format!(
                "{} ({}): {}.",
                c.label,
                plural(c.article_ids.len(), "article", "articles"),
                cited_titles(&c.article_ids, articles, &index).join("; ")
            )
        })
        .collect::<Vec<_>>()
        .join(" ");

    let sections = ScannableSections {
        top_developments: clusters
            .iter()
            .map(|c| format!("{} ({})", c.label, c.article_ids.len()))
            .collect(),
        by_the_numbers: vec![stories.clone(), topics.clone()],
        why_it_matters: None,
    };

    DigestDraft {
        title,
        tldr,
        key_moments,
        perspectives: Vec::new(),
        executive_summary,
        sections: Some(sections),
    }
}
