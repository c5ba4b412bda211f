use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

use crate::models::{PaymentMethod, PaymentStatus};

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once.
pub fn init_metrics() {
    if METRICS_HANDLE.get().is_some() {
        return;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = METRICS_HANDLE.set(handle);
        }
        Err(e) => tracing::warn!(error = %e, "Prometheus recorder not installed"),
    }
}

pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}

pub fn record_initiated(method: PaymentMethod) {
    metrics::counter!("payments_initiated_total", "method" => method.as_str()).increment(1);
}

pub fn record_settled(method: PaymentMethod, status: PaymentStatus) {
    metrics::counter!(
        "payments_settled_total",
        "method" => method.as_str(),
        "status" => status.as_str()
    )
    .increment(1);
}

/// `disposition` is one of `applied`, `duplicate`, `unmatched`, `ignored`,
/// `invalid` or `rejected`.
pub fn record_webhook(method: PaymentMethod, disposition: &'static str) {
    metrics::counter!(
        "payment_webhooks_total",
        "method" => method.as_str(),
        "disposition" => disposition
    )
    .increment(1);
}
