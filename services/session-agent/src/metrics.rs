//! Prometheus metrics exposition
//!
//! The session crate records through the `metrics` facade; this module
//! installs the process-wide recorder and adds the agent's own counter:
//!
//! - `agent_requests_total` (counter): labels `route`, `status`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Interactive logins range from a quick popup to a user wandering off.
const LOGIN_DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0];

fn builder() -> anyhow::Result<PrometheusBuilder> {
    Ok(PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full(session::metrics::LOGIN_DURATION_METRIC.to_string()),
        LOGIN_DURATION_BUCKETS,
    )?)
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// Record an API request by route and response status.
pub fn record_request(route: &str, status: u16) {
    metrics::counter!(
        "agent_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_without_recorder_is_a_no_op() {
        record_request("/session/token", 200);
    }

    #[test]
    fn requests_carry_route_and_status() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("/session/token", 200);
        record_request("/session/login", 409);

        let output = handle.render();
        assert!(output.contains("agent_requests_total"));
        assert!(output.contains("route=\"/session/token\""));
        assert!(output.contains("status=\"409\""));
    }

    #[test]
    fn login_duration_renders_as_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        session::metrics::record_login_duration("ok", 12.0);

        let output = handle.render();
        assert!(
            output.contains("session_login_duration_seconds_bucket"),
            "login duration must render _bucket lines, got: {output}"
        );
    }
}
