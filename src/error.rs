//! Error taxonomy for pipeline stages.
//!
//! Collaborators (fetchers, generators, embedders) report plain `anyhow` errors.
//! Stages collect per-item failures into their result lists and only surface
//! `PipelineError` for things that end a batch: cancellation, deadlines,
//! configuration problems and store failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The batch was cancelled by its caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The batch deadline elapsed before all work was dispatched.
    #[error("deadline exceeded after {secs}s")]
    DeadlineExceeded { secs: u64 },

    /// Missing credentials, invalid settings, nothing to work with.
    #[error("config error: {0}")]
    Config(String),

    /// Persistence store failed.
    #[error("store error: {0}")]
    Store(String),

    /// Text generation failed and no fallback applied.
    #[error("generation error: {0}")]
    Generation(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    /// A single source failed (kept for callers that want a typed error per source).
    #[error("source {url} failed: {message}")]
    Source { url: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// True for both explicit cancellation and deadline expiry.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded { .. })
    }

    pub fn store(e: impl std::fmt::Display) -> Self {
        Self::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
