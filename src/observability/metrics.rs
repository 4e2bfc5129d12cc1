//! Metrics collection and exposition.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Initialize metrics exporter and server.
pub fn init_metrics(addr: SocketAddr) {
    if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
        tracing::error!(error = %e, "failed to install Prometheus recorder");
        return;
    }

    tracing::info!("Metrics server listening on http://{}", addr);
}

/// Record a completed reload and the resulting API count.
pub fn record_reload(apis_loaded: usize) {
    counter!("gateway_reloads_total").increment(1);
    gauge!("gateway_apis_loaded").set(apis_loaded as f64);
}

/// Record one proxied API request.
pub fn record_api_request(api_id: &str, status: u16) {
    let labels = [
        ("api_id", api_id.to_string()),
        ("status", status.to_string()),
    ];
    counter!("gateway_api_requests_total", &labels).increment(1);
}
