//! Quality evaluator: coverage, vagueness, specificity and citation density of a
//! digest, graded A–D against configurable thresholds.
//!
//! Everything here is pure. Callers decide what to log or record.

use std::collections::BTreeSet;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::{Article, ArticleId, Digest};

/// Filler phrases that make a digest less useful.
pub const VAGUE_PHRASES: &[&str] = &[
    "a number of",
    "a lot of",
    "several",
    "various",
    "many",
    "some",
    "significant",
    "numerous",
    "recently",
    "things",
    "stuff",
    "certain",
];

/// Occurrences per 100 words that earn a full specificity component.
const FULL_COMPONENT_RATE: f64 = 5.0;
const COMPONENT_MAX: f64 = 25.0;

static RE_VAGUE: Lazy<Regex> = Lazy::new(|| {
    let alts = VAGUE_PHRASES
        .iter()
        .map(|p| regex::escape(p).replace(' ', r"\s+"))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{alts})\b")).unwrap()
});
static RE_CITATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\d+(?:\s*,\s*\d+)*)\]").unwrap());
static RE_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?u)\b\w[\w'’-]*").unwrap());
static RE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+(?:[.,]\d+)*\b").unwrap());
static RE_PERCENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b\d+(?:\.\d+)?\s?(?:%|percent\b)").unwrap());
static RE_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:(?:jan|feb|mar|apr|jun|jul|aug|sep|sept|oct|nov|dec)\.?|january|february|march|april|june|july|august|september|october|november|december|monday|tuesday|wednesday|thursday|friday|saturday|sunday|(?:19|20)\d{2}(?:-\d{2}-\d{2})?)\b",
    )
    .unwrap()
});
static RE_SENTENCE_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]+\s+|\n+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradeBand {
    pub coverage: f64,
    pub max_vague: usize,
    pub specificity: f64,
}

/// Per-grade minimums. Loaded from the `[quality]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradeThresholds {
    pub a: GradeBand,
    pub b: GradeBand,
    pub c: GradeBand,
}

impl Default for GradeThresholds {
    fn default() -> Self {
        Self {
            a: GradeBand {
                coverage: 0.8,
                max_vague: 2,
                specificity: 50.0,
            },
            b: GradeBand {
                coverage: 0.6,
                max_vague: 5,
                specificity: 35.0,
            },
            c: GradeBand {
                coverage: 0.4,
                max_vague: 10,
                specificity: 20.0,
            },
        }
    }
}

impl GradeThresholds {
    /// Bands must get no looser from C to A.
    pub fn validate(&self) -> Result<(), String> {
        for (name, band) in [("a", &self.a), ("b", &self.b), ("c", &self.c)] {
            if !(0.0..=1.0).contains(&band.coverage) {
                return Err(format!("quality.{name}.coverage must be within 0..=1"));
            }
            if !(0.0..=100.0).contains(&band.specificity) {
                return Err(format!("quality.{name}.specificity must be within 0..=100"));
            }
        }
        let ordered = |hi: &GradeBand, lo: &GradeBand| {
            hi.coverage >= lo.coverage
                && hi.max_vague <= lo.max_vague
                && hi.specificity >= lo.specificity
        };
        if !ordered(&self.a, &self.b) || !ordered(&self.b, &self.c) {
            return Err("quality bands must be ordered a >= b >= c".into());
        }
        Ok(())
    }

    fn band(&self, grade: Grade) -> Option<&GradeBand> {
        match grade {
            Grade::A => Some(&self.a),
            Grade::B => Some(&self.b),
            Grade::C => Some(&self.c),
            Grade::D => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
}

impl Grade {
    /// Next better grade, if any.
    pub fn next_up(self) -> Option<Grade> {
        match self {
            Grade::A => None,
            Grade::B => Some(Grade::A),
            Grade::C => Some(Grade::B),
            Grade::D => Some(Grade::C),
        }
    }

    fn rank(self) -> i32 {
        match self {
            Grade::A => 3,
            Grade::B => 2,
            Grade::C => 1,
            Grade::D => 0,
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Fraction of articles cited somewhere in the digest, in [0, 1].
    pub coverage: f64,
    /// Count of vague-phrase occurrences.
    pub vagueness: usize,
    /// 0–100.
    pub specificity: f64,
    /// Citation markers per 100 words.
    pub citation_density: f64,
    pub word_count: usize,
    pub cited_articles: usize,
    pub uncited_article_ids: Vec<ArticleId>,
    pub vague_phrases_found: Vec<String>,
    pub grade: Grade,
    /// Actionable hints toward the next grade.
    pub deltas: Vec<String>,
}

/// Difference between two reports; positive numbers mean the candidate is better.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityDelta {
    pub coverage: f64,
    /// Baseline minus candidate, so fewer vague phrases is positive.
    pub vagueness: i64,
    pub specificity: f64,
    pub citation_density: f64,
    pub grade_steps: i32,
    pub regressed: bool,
}

pub fn grade(
    coverage: f64,
    vagueness: usize,
    specificity: f64,
    thresholds: &GradeThresholds,
) -> Grade {
    let meets = |b: &GradeBand| {
        coverage >= b.coverage && vagueness <= b.max_vague && specificity >= b.specificity
    };
    if meets(&thresholds.a) {
        Grade::A
    } else if meets(&thresholds.b) {
        Grade::B
    } else if meets(&thresholds.c) {
        Grade::C
    } else {
        Grade::D
    }
}

/// Every vague-phrase occurrence, lowercased, in order of appearance.
pub fn vague_phrases(text: &str) -> Vec<String> {
    RE_VAGUE
        .find_iter(text)
        .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase())
        .collect()
}

/// All `[n]` / `[n, m]` indices found in `text`, with multiplicity.
pub fn citation_markers(text: &str) -> Vec<usize> {
    RE_CITATION
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .flat_map(|m| {
            m.as_str()
                .split(',')
                .filter_map(|n| n.trim().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .collect()
}

pub fn word_count(text: &str) -> usize {
    RE_WORD.find_iter(text).count()
}

fn rate_component(occurrences: usize, words: usize) -> f64 {
    if words == 0 {
        return 0.0;
    }
    let per_100 = occurrences as f64 * 100.0 / words as f64;
    (per_100 / FULL_COMPONENT_RATE).min(1.0) * COMPONENT_MAX
}

fn proper_nouns(text: &str) -> usize {
    let mut n = 0;
    for sentence in RE_SENTENCE_SPLIT.split(text) {
        for word in RE_WORD.find_iter(sentence).skip(1) {
            let mut chars = word.as_str().chars();
            let starts_upper = chars.next().is_some_and(char::is_uppercase);
            if starts_upper && chars.next().is_some() {
                n += 1;
            }
        }
    }
    n
}

/// Specificity score in 0..=100 (four components of up to 25 each).
pub fn specificity(text: &str) -> f64 {
    let stripped = RE_CITATION.replace_all(text, " ");
    let words = word_count(&stripped);
    let numbers = RE_NUMBER.find_iter(&stripped).count();
    let percents = RE_PERCENT.find_iter(&stripped).count();
    let dates = RE_DATE.find_iter(&stripped).count();
    let names = proper_nouns(&stripped);
    rate_component(numbers, words)
        + rate_component(percents, words)
        + rate_component(dates, words)
        + rate_component(names, words)
}

/// Citation indices the synthesized digest references: `[n]` markers in its
/// prose plus structured fields. Stage-1 narratives do not count.
pub fn cited_indices(digest: &Digest) -> BTreeSet<usize> {
    let mut out: BTreeSet<usize> = citation_markers(&digest.body_text()).into_iter().collect();
    out.extend(digest.key_moments.iter().map(|m| m.citation));
    for p in &digest.perspectives {
        out.extend(p.citations.iter().copied());
    }
    out
}

pub fn evaluate(digest: &Digest, articles: &[Article], thresholds: &GradeThresholds) -> QualityReport {
    let body = digest.body_text();
    let cited = cited_indices(digest);

    let mut uncited_article_ids = Vec::new();
    let mut cited_articles = 0;
    for a in articles {
        match digest.citation_for(a.id) {
            Some(idx) if cited.contains(&idx) => cited_articles += 1,
            _ => uncited_article_ids.push(a.id),
        }
    }
    let coverage = if articles.is_empty() {
        0.0
    } else {
        cited_articles as f64 / articles.len() as f64
    };

    let vague_phrases_found = vague_phrases(&body);
    let vagueness = vague_phrases_found.len();
    let specificity = specificity(&body);
    let words = word_count(&RE_CITATION.replace_all(&body, " "));
    let markers = citation_markers(&body).len();
    let citation_density = if words == 0 {
        0.0
    } else {
        markers as f64 * 100.0 / words as f64
    };

    let g = grade(coverage, vagueness, specificity, thresholds);
    let deltas = deltas_toward(
        g,
        coverage,
        vagueness,
        specificity,
        articles.len(),
        cited_articles,
        thresholds,
    );

    QualityReport {
        coverage,
        vagueness,
        specificity,
        citation_density,
        word_count: words,
        cited_articles,
        uncited_article_ids,
        vague_phrases_found,
        grade: g,
        deltas,
    }
}

fn deltas_toward(
    current: Grade,
    coverage: f64,
    vagueness: usize,
    specificity: f64,
    total: usize,
    cited: usize,
    thresholds: &GradeThresholds,
) -> Vec<String> {
    let Some(target) = current.next_up() else {
        return Vec::new();
    };
    let Some(band) = thresholds.band(target) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    if coverage < band.coverage && total > 0 {
        let needed = (band.coverage * total as f64).ceil() as usize;
        let more = needed.saturating_sub(cited).max(1);
        out.push(format!("cite {more} more articles to reach {target} coverage"));
    }
    if vagueness > band.max_vague {
        out.push(format!(
            "remove {} vague phrases to reach {target}",
            vagueness - band.max_vague
        ));
    }
    if specificity < band.specificity {
        out.push(format!(
            "add concrete numbers, dates and named entities (specificity {specificity:.0} < {:.0} for {target})",
            band.specificity
        ));
    }
    out
}

/// Issues a reviewer would raise about a draft, derived from its report.
pub fn local_critique(digest: &Digest, report: &QualityReport, thresholds: &GradeThresholds) -> Vec<String> {
    let mut issues = Vec::new();
    if !report.vague_phrases_found.is_empty() {
        let mut uniq: Vec<&str> = report.vague_phrases_found.iter().map(String::as_str).collect();
        uniq.sort_unstable();
        uniq.dedup();
        issues.push(format!("replace vague phrases: {}", uniq.join(", ")));
    }
    if !report.uncited_article_ids.is_empty() {
        let idx: Vec<String> = report
            .uncited_article_ids
            .iter()
            .filter_map(|id| digest.citation_for(*id))
            .map(|i| format!("[{i}]"))
            .collect();
        if !idx.is_empty() {
            issues.push(format!("cite the uncovered articles {}", idx.join(" ")));
        }
    }
    if report.specificity < thresholds.a.specificity {
        issues.push(format!(
            "low specificity ({:.0}); add numbers, dates and names",
            report.specificity
        ));
    }
    issues
}

pub fn compare(baseline: &QualityReport, candidate: &QualityReport) -> QualityDelta {
    let grade_steps = candidate.grade.rank() - baseline.grade.rank();
    let coverage = candidate.coverage - baseline.coverage;
    QualityDelta {
        coverage,
        vagueness: baseline.vagueness as i64 - candidate.vagueness as i64,
        specificity: candidate.specificity - baseline.specificity,
        citation_density: candidate.citation_density - baseline.citation_density,
        grade_steps,
        regressed: grade_steps < 0 || coverage < 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ArticleGroup, Citation, DigestDraft, GeneratedBy};

    fn articles(n: usize) -> Vec<Article> {
        (1..=n)
            .map(|i| {
                let mut a = Article::new(format!("https://x/{i}"), format!("Title {i}"), "text");
                a.id = i as i64;
                a
            })
            .collect()
    }

    fn digest_with(summary: &str, arts: &[Article]) -> Digest {
        let citations = arts
            .iter()
            .enumerate()
            .map(|(i, a)| Citation {
                index: i + 1,
                article_id: a.id,
                url: a.url.clone(),
                title: a.title.clone(),
            })
            .collect();
        let groups = vec![ArticleGroup {
            label: "g".into(),
            article_ids: arts.iter().map(|a| a.id).collect(),
            narrative: None,
        }];
        let draft = DigestDraft {
            title: "Digest".into(),
            executive_summary: summary.into(),
            ..Default::default()
        };
        Digest::new(draft, groups, citations, GeneratedBy::Template, 0)
    }

    #[test]
    fn vague_phrases_are_whole_word_case_insensitive() {
        let found = vague_phrases("Several firms did SOME things; handsome gains. A  number of them.");
        assert_eq!(found, vec!["several", "some", "things", "a number of"]);
    }

    #[test]
    fn coverage_full_when_every_article_cited() {
        let arts = articles(3);
        let d = digest_with("Rates rose [1]. Jobs fell [2, 3].", &arts);
        let r = evaluate(&d, &arts, &GradeThresholds::default());
        assert_eq!(r.coverage, 1.0);
        assert!(r.uncited_article_ids.is_empty());
    }

    #[test]
    fn coverage_zero_without_markers() {
        let arts = articles(3);
        let d = digest_with("Rates rose. Jobs fell.", &arts);
        let r = evaluate(&d, &arts, &GradeThresholds::default());
        assert_eq!(r.coverage, 0.0);
        assert_eq!(r.uncited_article_ids, vec![1, 2, 3]);
        assert!(r.deltas.iter().any(|d| d.contains("more articles")));
    }

    #[test]
    fn narrative_citations_do_not_count_toward_coverage() {
        let arts = articles(2);
        let mut d = digest_with("Things moved.", &arts);
        d.article_groups[0].narrative = Some(crate::model::ClusterNarrative {
            title: "g".into(),
            body: "Title 1 [1]; Title 2 [2].".into(),
        });
        let t = GradeThresholds::default();
        let r = evaluate(&d, &arts, &t);
        assert_eq!(r.coverage, 0.0);
        assert_eq!(r.uncited_article_ids, vec![1, 2]);
        let issues = local_critique(&d, &r, &t);
        assert!(issues.iter().any(|i| i == "cite the uncovered articles [1] [2]"));
    }

    #[test]
    fn empty_article_set_has_zero_coverage() {
        let d = digest_with("Something [1].", &[]);
        assert_eq!(evaluate(&d, &[], &GradeThresholds::default()).coverage, 0.0);
    }

    #[test]
    fn specificity_rewards_concrete_text() {
        let vague = specificity("things happened and stuff changed in a way people noticed");
        let concrete =
            specificity("On March 3, 2025 the Federal Reserve raised rates 0.25% to 5.5% in Washington.");
        assert!(concrete > vague);
        assert!(concrete <= 100.0);
        assert_eq!(specificity(""), 0.0);
    }

    #[test]
    fn grade_bands() {
        let t = GradeThresholds::default();
        assert_eq!(grade(0.9, 0, 60.0, &t), Grade::A);
        assert_eq!(grade(0.9, 3, 60.0, &t), Grade::B);
        assert_eq!(grade(0.5, 0, 60.0, &t), Grade::C);
        assert_eq!(grade(0.1, 0, 60.0, &t), Grade::D);
    }

    #[test]
    fn thresholds_must_be_ordered() {
        let mut t = GradeThresholds::default();
        assert!(t.validate().is_ok());
        t.c.coverage = 0.95;
        assert!(t.validate().is_err());
    }

    #[test]
    fn compare_flags_regressions() {
        let arts = articles(2);
        let good = evaluate(&digest_with("A [1] B [2].", &arts), &arts, &GradeThresholds::default());
        let bad = evaluate(&digest_with("A [1].", &arts), &arts, &GradeThresholds::default());
        let d = compare(&good, &bad);
        assert!(d.regressed);
        assert!(d.coverage < 0.0);
        assert!(!compare(&bad, &good).regressed);
    }

    #[test]
    fn local_critique_names_uncited_indices() {
        let arts = articles(2);
        let d = digest_with("Several moves [1].", &arts);
        let t = GradeThresholds::default();
        let r = evaluate(&d, &arts, &t);
        let issues = local_critique(&d, &r, &t);
        assert!(issues.iter().any(|i| i.contains("[2]")));
        assert!(issues.iter().any(|i| i.contains("several")));
    }
}
