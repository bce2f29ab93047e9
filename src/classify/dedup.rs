//! Near-duplicate guard for titles accepted within one classification pass.
//!
//! Similarity metric: normalized Levenshtein similarity in [0.0, 1.0] over
//! lowercased, whitespace-collapsed titles.

/// Remembers accepted titles; a new title is a duplicate when any remembered
/// title has similarity >= `threshold`.
#[derive(Debug, Clone)]
pub struct NearDuplicateGuard {
    threshold: f64,
    seen: Vec<String>,
}

impl NearDuplicateGuard {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            seen: Vec::new(),
        }
    }

    pub fn is_duplicate(&self, title: &str) -> bool {
        let norm = normalize(title);
        if norm.is_empty() {
            return false;
        }
        self.seen
            .iter()
            .rev()
            .any(|s| strsim::normalized_levenshtein(&norm, s) >= self.threshold)
    }

    pub fn remember(&mut self, title: &str) {
        let norm = normalize(title);
        if !norm.is_empty() {
            self.seen.push(norm);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Normalize text before similarity
fn normalize(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}
