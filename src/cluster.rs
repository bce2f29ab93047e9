//! Topic clusterer: seeded k-means++ over cosine distance.
//!
//! Output is a partition of the input: every article lands in exactly one
//! non-empty cluster. Same vectors + same seed give the same clusters.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{Article, ArticleId, Theme, ThemeId, TopicCluster};

pub const MIN_AUTO_K: usize = 3;
pub const MAX_AUTO_K: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterParams {
    pub seed: u64,
    pub max_iterations: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            seed: 42,
            max_iterations: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Cluster index per input vector.
    pub labels: Vec<usize>,
    pub centroids: Vec<Vec<f32>>,
    pub iterations: usize,
    pub converged: bool,
}

/// `clamp(round(n / 5), 3, 15)`, never more than `n`.
pub fn choose_k(n: usize) -> usize {
    let k = ((n as f64) / 5.0).round() as usize;
    k.clamp(MIN_AUTO_K, MAX_AUTO_K).min(n)
}

/// A caller-supplied K clamped to `[1, n]`, else [`choose_k`].
pub fn effective_k(n: usize, requested: Option<usize>) -> usize {
    match requested {
        Some(k) => k.clamp(1, n.max(1)).min(n),
        None => choose_k(n),
    }
}

/// `1 - cos(a, b)`; a zero-norm vector is at distance 1 from everything.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (na.sqrt() * nb.sqrt())).clamp(0.0, 2.0)
}

/// Closest centroid; ties go to the lowest index.
fn nearest(point: &[f32], centroids: &[Vec<f32>]) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (i, c) in centroids.iter().enumerate() {
        let d = cosine_distance(point, c);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

fn seed_centroids(vectors: &[Vec<f32>], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let n = vectors.len();
    let first = rng.random_range(0..n);
    let mut chosen = vec![false; n];
    chosen[first] = true;
    let mut centroids = vec![vectors[first].clone()];

    while centroids.len() < k {
        let weights: Vec<f64> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| {
                if chosen[i] {
                    0.0
                } else {
                    let d = nearest(v, &centroids).1 as f64;
                    d * d
                }
            })
            .collect();
        let total: f64 = weights.iter().sum();

        let pick = if total <= 0.0 {
            (0..n).find(|i| !chosen[*i])
        } else {
            let r = rng.random::<f64>() * total;
            let mut acc = 0.0;
            let mut pick = None;
            for (i, w) in weights.iter().enumerate() {
                if *w <= 0.0 {
                    continue;
                }
                acc += w;
                pick = Some(i);
                if acc > r {
                    break;
                }
            }
            pick
        };
        let Some(i) = pick else { break };
        chosen[i] = true;
        centroids.push(vectors[i].clone());
    }
    centroids
}

fn mean_centroids(vectors: &[Vec<f32>], labels: &[usize], k: usize, dims: usize) -> (Vec<Vec<f32>>, Vec<usize>) {
    let mut sums = vec![vec![0.0f32; dims]; k];
    let mut counts = vec![0usize; k];
    for (v, &l) in vectors.iter().zip(labels) {
        counts[l] += 1;
        for (s, x) in sums[l].iter_mut().zip(v) {
            *s += x;
        }
    }
    for (s, &c) in sums.iter_mut().zip(&counts) {
        if c > 0 {
            for x in s.iter_mut() {
                *x /= c as f32;
            }
        }
    }
    (sums, counts)
}

/// Re-seed each empty cluster with the point farthest from its own centroid,
/// taken from a cluster that keeps at least one member. Returns whether anything moved.
fn repair_empty(
    vectors: &[Vec<f32>],
    labels: &mut [usize],
    centroids: &mut [Vec<f32>],
    counts: &mut [usize],
) -> bool {
    let mut moved = false;
    for c in 0..centroids.len() {
        if counts[c] > 0 {
            continue;
        }
        let mut donor: Option<(usize, f32)> = None;
        for (i, v) in vectors.iter().enumerate() {
            let from = labels[i];
            if counts[from] < 2 {
                continue;
            }
            let d = cosine_distance(v, &centroids[from]);
            // Strictly farther wins, so ties keep the lowest index.
            let farther = match donor {
                None => true,
                Some((_, best)) => d > best,
            };
            if farther {
                donor = Some((i, d));
            }
        }
        let Some((p, _)) = donor else { continue };
        let from = labels[p];
        labels[p] = c;
        counts[from] -= 1;
        counts[c] = 1;
        centroids[c] = vectors[p].clone();
        centroids[from] = recompute_one(vectors, labels, from, centroids[from].len());
        moved = true;
    }
    moved
}

fn recompute_one(vectors: &[Vec<f32>], labels: &[usize], cluster: usize, dims: usize) -> Vec<f32> {
    let mut sum = vec![0.0f32; dims];
    let mut count = 0usize;
    for (v, &l) in vectors.iter().zip(labels) {
        if l == cluster {
            count += 1;
            for (s, x) in sum.iter_mut().zip(v) {
                *s += x;
            }
        }
    }
    if count > 0 {
        for x in sum.iter_mut() {
            *x /= count as f32;
        }
    }
    sum
}

/// Lloyd iterations from a k-means++ seeding. `k` is clamped to the number of vectors.
pub fn kmeans(vectors: &[Vec<f32>], k: usize, params: &ClusterParams) -> Assignment {
    let n = vectors.len();
    let k = k.min(n);
    if n == 0 || k == 0 {
        return Assignment {
            labels: Vec::new(),
            centroids: Vec::new(),
            iterations: 0,
            converged: true,
        };
    }
    let dims = vectors.iter().map(Vec::len).max().unwrap_or(0);
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut centroids = seed_centroids(vectors, k, &mut rng);
    let k = centroids.len();

    let mut labels = vec![usize::MAX; n];
    let mut iterations = 0;
    let mut converged = false;

    for it in 1..=params.max_iterations.max(1) {
        iterations = it;
        let assigned: Vec<usize> = vectors.iter().map(|v| nearest(v, &centroids).0).collect();
        let mut changed = assigned != labels;
        labels = assigned;

        let (mut next, mut counts) = mean_centroids(vectors, &labels, k, dims);
        for (c, cnt) in counts.iter().enumerate() {
            // Keep the old centroid until repair gives it a member.
            if *cnt == 0 {
                next[c] = centroids[c].clone();
            }
        }
        centroids = next;
        if repair_empty(vectors, &mut labels, &mut centroids, &mut counts) {
            changed = true;
        }
        if !changed {
            converged = true;
            break;
        }
    }

    debug!(target: "cluster", n, k, iterations, converged, "k-means finished");
    Assignment {
        labels,
        centroids,
        iterations,
        converged,
    }
}

/// Partition `articles` into topic clusters, largest first.
///
/// Articles without a current embedding are treated as zero vectors; callers
/// normally filter them out first.
pub fn cluster_articles(
    articles: &[Article],
    k: Option<usize>,
    params: &ClusterParams,
    themes: &[Theme],
) -> Vec<TopicCluster> {
    let n = articles.len();
    if n == 0 {
        return Vec::new();
    }
    let dims = articles
        .iter()
        .filter_map(|a| a.embedding().map(<[f32]>::len))
        .max()
        .unwrap_or(0);
    let vectors: Vec<Vec<f32>> = articles
        .iter()
        .map(|a| match a.embedding() {
            Some(v) if !a.needs_embedding() => v.to_vec(),
            _ => vec![0.0; dims],
        })
        .collect();

    let assignment = kmeans(&vectors, effective_k(n, k), params);
    let theme_names: HashMap<ThemeId, &str> = themes.iter().map(|t| (t.id, t.name.as_str())).collect();

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); assignment.centroids.len()];
    for (i, &l) in assignment.labels.iter().enumerate() {
        members[l].push(i);
    }

    let mut clusters: Vec<(usize, TopicCluster)> = members
        .into_iter()
        .enumerate()
        .filter(|(_, m)| !m.is_empty())
        .map(|(c, m)| {
            let centroid = &assignment.centroids[c];
            let mut rep = m[0];
            let mut best = f32::INFINITY;
            for &i in &m {
                let d = cosine_distance(&vectors[i], centroid);
                if d < best {
                    best = d;
                    rep = i;
                }
            }
            let label = cluster_label(&articles[rep], &theme_names);
            let ids: Vec<ArticleId> = m.iter().map(|&i| articles[i].id).collect();
            (
                m[0],
                TopicCluster {
                    label,
                    article_ids: ids,
                    narrative: None,
                },
            )
        })
        .collect();

    clusters.sort_by(|(fa, a), (fb, b)| {
        b.article_ids
            .len()
            .cmp(&a.article_ids.len())
            .then(fa.cmp(fb))
    });
    clusters.into_iter().map(|(_, c)| c).collect()
}

fn cluster_label(rep: &Article, theme_names: &HashMap<ThemeId, &str>) -> String {
    match rep.theme_id.and_then(|id| theme_names.get(&id)) {
        Some(theme) => format!("{theme}: {}", rep.title),
        None => rep.title.clone(),
    }
}

/// Write each cluster's label onto its member articles. Returns the ids touched.
pub fn apply_labels(articles: &mut [Article], clusters: &[TopicCluster]) -> Vec<ArticleId> {
    let by_id: HashMap<ArticleId, &str> = clusters
        .iter()
        .flat_map(|c| c.article_ids.iter().map(move |id| (*id, c.label.as_str())))
        .collect();
    let mut touched = Vec::new();
    for a in articles.iter_mut() {
        if let Some(label) = by_id.get(&a.id) {
            a.cluster_label = Some((*label).to_string());
            touched.push(a.id);
        }
    }
    touched
}
