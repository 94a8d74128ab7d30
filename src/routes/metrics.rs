use axum::extract::State;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// GET /metrics: Prometheus text exposition of queue, ledger and pipeline metrics.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> String {
    handle.render()
}

/// Register descriptions for every metric the pipelines emit.
pub fn describe() {
    metrics::describe_counter!("jobs_enqueued_total", "Jobs added to a queue");
    metrics::describe_counter!("jobs_completed_total", "Jobs that finished successfully");
    metrics::describe_counter!("jobs_failed_total", "Jobs whose handler returned an error or panicked");
    metrics::describe_histogram!("job_duration_seconds", "Wall time of one job handler run");
    metrics::describe_gauge!("queue_waiting_jobs", "Jobs waiting for dispatch");
    metrics::describe_counter!("credits_refunded_total", "Credits returned by compensating refunds");
    metrics::describe_counter!("curation_items_total", "Curated image decisions by outcome");
    metrics::describe_counter!("characters_generated_total", "Characters generated from curated images");
    metrics::describe_counter!("stage_failures_total", "Failed generation stages by view");
    metrics::describe_histogram!("stage_duration_seconds", "Wall time of one successful generation stage");
}
