// src/config/mod.rs
//! Pipeline configuration: `config/pipeline.toml` with env overrides.
//!
//! Every field has a default, so an empty file (or no file) is a valid config.
//! `validate()` is the single place that rejects bad settings; it runs before
//! any work starts.

pub mod ai;

pub use ai::AiConfig;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::classify::ClassifyOptions;
use crate::cluster::ClusterParams;
use crate::error::PipelineError;
use crate::ingest::AggregateOptions;
use crate::model::{NewSource, NewTheme};
use crate::quality::GradeThresholds;
use crate::synth::SynthOptions;

pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";
pub const ENV_CONFIG_PATH: &str = "DIGEST_CONFIG_PATH";
pub const ENV_MIN_RELEVANCE: &str = "DIGEST_MIN_RELEVANCE";
pub const ENV_MAX_CONCURRENCY: &str = "DIGEST_MAX_CONCURRENCY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateSection {
    pub max_items_per_source: usize,
    pub max_concurrency: usize,
    /// Items older than this are ignored; also the digest window.
    pub lookback_hours: u64,
    /// 0 = no deadline.
    pub timeout_secs: u64,
}

impl Default for AggregateSection {
    fn default() -> Self {
        Self {
            max_items_per_source: 25,
            max_concurrency: 8,
            lookback_hours: 24,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifySection {
    pub min_relevance: f32,
    /// Only keep articles whose best theme has this name.
    pub theme_filter: Option<String>,
    pub max_concurrency: usize,
    pub timeout_secs: u64,
    pub dedup_similarity: f64,
}

impl Default for ClassifySection {
    fn default() -> Self {
        Self {
            min_relevance: 0.5,
            theme_filter: None,
            max_concurrency: 4,
            timeout_secs: 300,
            dedup_similarity: 0.92,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Fixed K; `None` lets the clusterer choose.
    pub k: Option<usize>,
    pub seed: u64,
    pub max_iterations: usize,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            k: None,
            seed: 42,
            max_iterations: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthSection {
    pub critique_rounds: u32,
}

impl Default for SynthSection {
    fn default() -> Self {
        Self {
            critique_rounds: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// `None` keeps the cache in memory.
    pub dir: Option<PathBuf>,
    pub body_ttl_secs: u64,
    pub summary_ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            dir: None,
            body_ttl_secs: crate::cache::BODY_TTL.as_secs(),
            summary_ttl_secs: crate::cache::SUMMARY_TTL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub aggregate: AggregateSection,
    pub classify: ClassifySection,
    pub cluster: ClusterSection,
    pub synth: SynthSection,
    pub cache: CacheSection,
    pub quality: GradeThresholds,
    pub ai: AiConfig,
    pub store: StoreSection,
    pub sources: Vec<NewSource>,
    pub themes: Vec<NewTheme>,
}

// parse optional float env and clamp to <0.0..=1.0>
fn parse_threshold_env(raw: Option<String>) -> Option<f32> {
    raw.and_then(|s| s.trim().parse::<f32>().ok())
        .map(|v| v.clamp(0.0, 1.0))
}

fn parse_concurrency_env(raw: Option<String>) -> Option<usize> {
    raw.and_then(|s| s.trim().parse::<usize>().ok())
        .map(|v| v.clamp(1, 256))
}

impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let cfg: PipelineConfig = toml::from_str(s).context("parsing pipeline config")?;
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Resolve the path from `DIGEST_CONFIG_PATH` (must exist if set), else the
    /// default path (defaults if absent), then apply env overrides.
    pub fn load_default() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var(ENV_CONFIG_PATH) {
            Ok(p) => {
                let pb = PathBuf::from(p);
                if !pb.exists() {
                    anyhow::bail!("{ENV_CONFIG_PATH} points to non-existent path");
                }
                Self::load_from(&pb)?
            }
            Err(_) => {
                let pb = PathBuf::from(DEFAULT_CONFIG_PATH);
                if pb.exists() {
                    Self::load_from(&pb)?
                } else {
                    info!("no {DEFAULT_CONFIG_PATH}; using built-in defaults");
                    Self::default()
                }
            }
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = parse_threshold_env(std::env::var(ENV_MIN_RELEVANCE).ok()) {
            self.classify.min_relevance = v;
        }
        if let Some(v) = parse_concurrency_env(std::env::var(ENV_MAX_CONCURRENCY).ok()) {
            self.aggregate.max_concurrency = v;
            self.classify.max_concurrency = v;
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let bad = |msg: String| Err(PipelineError::Config(msg));
        if !(0.0..=1.0).contains(&self.classify.min_relevance) {
            return bad("classify.min_relevance must be within 0..=1".into());
        }
        if !(0.0 < self.classify.dedup_similarity && self.classify.dedup_similarity <= 1.0) {
            return bad("classify.dedup_similarity must be within (0, 1]".into());
        }
        if self.aggregate.max_concurrency == 0 || self.classify.max_concurrency == 0 {
            return bad("max_concurrency must be at least 1".into());
        }
        if self.cluster.k == Some(0) {
            return bad("cluster.k must be at least 1 when set".into());
        }
        if self.cluster.max_iterations == 0 {
            return bad("cluster.max_iterations must be at least 1".into());
        }
        if self.synth.critique_rounds > 10 {
            return bad("synth.critique_rounds must be at most 10".into());
        }
        self.quality.validate().map_err(PipelineError::Config)?;
        self.ai.validate().map_err(|e| PipelineError::Config(format!("{e:#}")))?;
        Ok(())
    }

    /// Start of the digest window relative to `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::hours(self.aggregate.lookback_hours as i64)
    }

    pub fn aggregate_options(&self, now: DateTime<Utc>) -> AggregateOptions {
        AggregateOptions {
            max_items_per_source: self.aggregate.max_items_per_source,
            max_concurrency: self.aggregate.max_concurrency,
            since: Some(self.window_start(now)),
            timeout: secs_opt(self.aggregate.timeout_secs),
        }
    }

    pub fn classify_options(&self) -> ClassifyOptions {
        ClassifyOptions {
            min_relevance: self.classify.min_relevance,
            theme_filter: self.classify.theme_filter.clone(),
            max_concurrency: self.classify.max_concurrency,
            timeout: secs_opt(self.classify.timeout_secs),
            dedup_similarity: self.classify.dedup_similarity,
            body_ttl: Duration::from_secs(self.cache.body_ttl_secs),
        }
    }

    pub fn cluster_params(&self) -> ClusterParams {
        ClusterParams {
            seed: self.cluster.seed,
            max_iterations: self.cluster.max_iterations,
        }
    }

    pub fn synth_options(&self) -> SynthOptions {
        SynthOptions {
            critique_rounds: self.synth.critique_rounds,
            summary_ttl: Duration::from_secs(self.cache.summary_ttl_secs),
            thresholds: self.quality,
        }
    }
}

fn secs_opt(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
