use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up in the exposition).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "aggregate_sources_fetched_total",
            "Sources fetched with new content."
        );
        describe_counter!(
            "aggregate_sources_skipped_total",
            "Sources that answered not-modified."
        );
        describe_counter!(
            "aggregate_sources_failed_total",
            "Sources whose fetch failed."
        );
        describe_counter!(
            "aggregate_items_new_total",
            "New candidate items persisted."
        );
        describe_counter!(
            "ingest_items_parsed_total",
            "Items parsed from feed documents."
        );
        describe_histogram!("ingest_parse_ms", "Feed parse time in milliseconds.");
        describe_counter!(
            "classify_articles_total",
            "Candidates processed by the classifier, by outcome."
        );
        describe_counter!(
            "synth_fallback_total",
            "Templated fallbacks used instead of generated text."
        );
        describe_histogram!("synth_critique_rounds", "Critique rounds per digest.");
        describe_gauge!("quality_coverage", "Coverage of the latest digest.");
        describe_gauge!(
            "pipeline_last_run_ts",
            "Unix ts when the pipeline last finished."
        );
    });
}

/// Install the Prometheus recorder for the process.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("prometheus: install recorder: {e}"))?;
    ensure_metrics_described();
    Ok(handle)
}
