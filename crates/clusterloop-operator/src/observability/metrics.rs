//! Prometheus Metrics
//!
//! Metrics tracked:
//! - `clusterloop_reconcile_total` - counter of reconciles by controller and result
//! - `clusterloop_reconcile_duration_seconds` - histogram of reconcile times
//! - `clusterloop_workqueue_depth` - gauge of keys waiting per controller
//! - `clusterloop_resolver_rewatch_total` - counter of APIExport watch reopenings

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// State containing the Prometheus handle for metrics export
#[derive(Clone)]
pub struct MetricsState {
    pub prometheus_handle: PrometheusHandle,
}

impl MetricsState {
    pub fn render(&self) -> String {
        self.prometheus_handle.render()
    }
}

/// Install the Prometheus recorder and register metric descriptions.
pub fn init_metrics() -> Result<MetricsState, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metric_descriptions();
    Ok(MetricsState {
        prometheus_handle: handle,
    })
}

fn register_metric_descriptions() {
    describe_counter!(
        "clusterloop_reconcile_total",
        "Total number of reconciles by controller and result"
    );
    describe_histogram!(
        "clusterloop_reconcile_duration_seconds",
        "Duration of reconciles in seconds"
    );
    describe_gauge!(
        "clusterloop_workqueue_depth",
        "Number of keys waiting to be reconciled"
    );
    describe_counter!(
        "clusterloop_resolver_rewatch_total",
        "Total number of times the APIExport watch was reopened"
    );
}

/// Record one finished reconcile.
pub fn record_reconcile(controller: &str, result: &str, duration: Duration) {
    counter!(
        "clusterloop_reconcile_total",
        "controller" => controller.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
    histogram!(
        "clusterloop_reconcile_duration_seconds",
        "controller" => controller.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Update the work queue depth gauge
pub fn set_queue_depth(controller: &str, depth: usize) {
    gauge!("clusterloop_workqueue_depth", "controller" => controller.to_string()).set(depth as f64);
}

/// Record that the resolver reopened its watch
pub fn record_rewatch() {
    counter!("clusterloop_resolver_rewatch_total").increment(1);
}
