//! Prometheus metrics exposition
//!
//! Gateway metrics, rendered on `/metrics` together with the session core's
//! `auth_session_*` series:
//!
//! - `gateway_requests_total` (counter): labels `route`, `status`
//! - `gateway_request_duration_seconds` (histogram): label `route`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "gateway_request_duration_seconds";

/// Bucket boundaries from 5ms to 30s; callback and refresh round-trips to
/// the identity provider dominate the upper range.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed request with route and status labels.
pub fn record_request(route: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!("gateway_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "route" => route).record(duration_secs);
}

#[cfg(test)]
pub(crate) fn isolated_recorder() -> (
    metrics_exporter_prometheus::PrometheusRecorder,
    PrometheusHandle,
) {
    // build_recorder() avoids the global singleton; install_recorder() panics
    // on a second call in the same process.
    let recorder = builder().build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_request_without_recorder_is_a_noop() {
        record_request("/health", 200, 0.001);
    }

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("/callback", 302, 0.2);
        record_request("/callback", 409, 0.01);

        let output = handle.render();
        assert!(output.contains("gateway_requests_total"));
        assert!(output.contains("route=\"/callback\""));
        assert!(output.contains("status=\"302\""));
        assert!(output.contains("status=\"409\""));
        assert!(
            output.contains("gateway_request_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
        assert!(output.contains("le=\"30\""));
    }
}
