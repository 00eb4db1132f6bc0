use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::services::queue::{JobQueue, RedisJobQueue};

/// State for the scrape endpoint, kept apart from the API state.
#[derive(Clone)]
pub struct MetricsState {
    pub handle: Arc<PrometheusHandle>,
    pub queue: Arc<RedisJobQueue>,
}

/// Prometheus scrape endpoint. Queue depth gauges are refreshed on each scrape.
pub async fn prometheus_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    match state.queue.status().await {
        Ok(status) => {
            metrics::gauge!("import_queue_depth", "group" => "pending").set(status.pending as f64);
            metrics::gauge!("import_queue_depth", "group" => "running").set(status.running as f64);
            metrics::gauge!("import_queue_depth", "group" => "scheduled")
                .set(status.scheduled as f64);
        }
        Err(e) => tracing::warn!(error = %e, "Queue depth unavailable for metrics"),
    }
    state.handle.render()
}
