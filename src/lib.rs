// src/lib.rs
// Public library surface for the batch binary and integration tests.

pub mod cache;
pub mod classify;
pub mod cluster;
pub mod config;
pub mod embed;
pub mod error;
pub mod generate;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod quality;
pub mod store;
pub mod synth;

// ---- Re-exports for stable public API ----
pub use crate::config::PipelineConfig;
pub use crate::error::{PipelineError, Result};
pub use crate::pipeline::{Pipeline, PipelineReport};
