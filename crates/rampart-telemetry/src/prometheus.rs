//! Prometheus text exposition format rendering.
//!
//! Exposed by the control plane at `/metrics`.

use crate::MetricsRegistry;
use prometheus_client::encoding::text::encode;

/// Content-Type header value for Prometheus text format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Render the metrics registry to Prometheus text format.
pub fn render_metrics(registry: &MetricsRegistry) -> String {
    let mut buffer = String::new();
    encode(&mut buffer, &registry.registry).expect("encoding metrics should not fail");
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_metrics_empty() {
        let registry = MetricsRegistry::new();
        let output = render_metrics(&registry);

        assert!(output.contains("rampart_releases_total"));
        assert!(output.contains("rampart_rollouts_in_flight"));
    }

    #[test]
    fn test_render_metrics_with_data() {
        let registry = MetricsRegistry::new();

        registry.record_release("version_publish", "accepted");
        registry.rollout_started();

        let output = render_metrics(&registry);

        assert!(output.contains("source=\"version_publish\""));
        assert!(output.contains("rampart_rollouts_in_flight 1"));
    }
}
