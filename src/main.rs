//! News digest batch entrypoint.
//! Loads config, runs one pipeline pass, logs the report and saves the store snapshot.

use std::sync::Arc;

use news_digest::config::PipelineConfig;
use news_digest::metrics::init_prometheus;
use news_digest::store::MemoryStore;
use news_digest::Pipeline;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// RUST_LOG wins; DIGEST_LOG_JSON=1 switches to JSON lines.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("news_digest=info,warn"));
    let json = std::env::var("DIGEST_LOG_JSON").ok().as_deref() == Some("1");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let _prometheus = match init_prometheus() {
        Ok(h) => Some(h),
        Err(e) => {
            warn!(error = %e, "metrics recorder not installed");
            None
        }
    };

    let config = PipelineConfig::load_default()?;
    let store = match &config.store.snapshot_path {
        Some(p) => Arc::new(MemoryStore::load_snapshot(p)?),
        None => Arc::new(MemoryStore::new()),
    };

    let pipeline = Pipeline::from_config(config.clone(), store.clone())?;
    let seeded = pipeline.seed().await?;
    info!(sources = seeded.sources, themes = seeded.themes, "seeded from config");

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            ctrl_c.cancel();
        }
    });

    let outcome = pipeline.run(&cancel).await;

    if let Some(p) = &config.store.snapshot_path {
        if let Err(e) = store.save_snapshot(p) {
            error!(path = %p.display(), error = %e, "snapshot save failed");
        }
    }

    match outcome {
        Ok(report) => {
            match (&report.digest, &report.quality) {
                (Some(d), Some(q)) => info!(
                    digest_id = d.id,
                    title = %d.title,
                    articles = d.article_count(),
                    grade = %q.grade,
                    coverage = q.coverage,
                    "digest ready"
                ),
                _ => info!("no digest this pass"),
            }
            Ok(())
        }
        Err(e) if e.is_cancellation() => {
            warn!(error = %e, "pass stopped early");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
