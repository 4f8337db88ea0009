//! Session metrics
//!
//! Recorded through the `metrics` facade; the host installs the recorder.
//!
//! - `session_token_requests_total` (counter): labels `source`, `outcome`
//! - `session_renewal_cycles_total` (counter): label `outcome`
//! - `session_stuck_interaction_recoveries_total` (counter)
//! - `session_login_duration_seconds` (histogram): label `outcome`

/// Histogram name for interactive logins, for hosts that configure buckets.
pub const LOGIN_DURATION_METRIC: &str = "session_login_duration_seconds";

/// Where a token handed to a caller came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Cache,
    Silent,
    Interactive,
    Redirect,
}

impl TokenSource {
    pub fn label(&self) -> &'static str {
        match self {
            TokenSource::Cache => "cache",
            TokenSource::Silent => "silent",
            TokenSource::Interactive => "interactive",
            TokenSource::Redirect => "redirect",
        }
    }
}

pub fn record_token_request(source: TokenSource, outcome: &'static str) {
    metrics::counter!(
        "session_token_requests_total",
        "source" => source.label(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_renewal_cycle(outcome: &'static str) {
    metrics::counter!("session_renewal_cycles_total", "outcome" => outcome).increment(1);
}

pub fn record_stuck_recovery() {
    metrics::counter!("session_stuck_interaction_recoveries_total").increment(1);
}

pub fn record_login_duration(outcome: &'static str, duration_secs: f64) {
    metrics::histogram!(LOGIN_DURATION_METRIC, "outcome" => outcome).record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn no_recorder_is_a_no_op() {
        record_token_request(TokenSource::Cache, "ok");
        record_renewal_cycle("error");
        record_stuck_recovery();
        record_login_duration("ok", 1.0);
    }

    #[test]
    fn token_requests_carry_source_and_outcome() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_token_request(TokenSource::Silent, "ok");
        record_token_request(TokenSource::Interactive, "error");

        let output = handle.render();
        assert!(output.contains("session_token_requests_total"));
        assert!(output.contains("source=\"silent\""));
        assert!(output.contains("source=\"interactive\""));
        assert!(output.contains("outcome=\"error\""));
    }

    #[test]
    fn renewal_and_recovery_counters() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_renewal_cycle("account_lost");
        record_stuck_recovery();
        record_stuck_recovery();

        let output = handle.render();
        assert!(output.contains("session_renewal_cycles_total{outcome=\"account_lost\"} 1"));
        assert!(output.contains("session_stuck_interaction_recoveries_total 2"));
    }
}
