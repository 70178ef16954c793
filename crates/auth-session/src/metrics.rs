//! Session metrics
//!
//! Recorded through the `metrics` facade; the host decides whether a
//! recorder is installed. Without one these calls are no-ops.
//!
//! - `auth_session_transitions_total` (counter): labels `from`, `to`
//! - `auth_session_adapter_calls_total` (counter): labels `provider`, `operation`, `outcome`
//! - `auth_session_refresh_total` (counter): labels `trigger`, `outcome`

use crate::session::SessionState;

/// Record a committed state transition.
pub fn record_transition(from: SessionState, to: SessionState) {
    metrics::counter!(
        "auth_session_transitions_total",
        "from" => from.label(),
        "to" => to.label()
    )
    .increment(1);
}

/// Record one adapter call and whether it succeeded.
pub fn record_adapter_call(provider: &str, operation: &'static str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    metrics::counter!(
        "auth_session_adapter_calls_total",
        "provider" => provider.to_string(),
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a refresh attempt. `trigger` is what asked for it (`explicit`,
/// `access_token`, `background`), `outcome` is `ok`, `skipped` or an error label.
pub fn record_refresh(trigger: &'static str, outcome: &'static str) {
    metrics::counter!(
        "auth_session_refresh_total",
        "trigger" => trigger,
        "outcome" => outcome
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_transition(SessionState::Unauthenticated, SessionState::Authenticating);
        record_adapter_call("mock", "refresh", false);
        record_refresh("explicit", "ok");
    }

    /// Isolated recorder so tests never fight over the global one.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn transition_counter_carries_state_labels() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_transition(SessionState::PendingCallback, SessionState::Authenticated);

        let output = handle.render();
        assert!(output.contains("auth_session_transitions_total"));
        assert!(output.contains("from=\"pending_callback\""));
        assert!(output.contains("to=\"authenticated\""));
    }

    #[test]
    fn adapter_and_refresh_counters_carry_outcome() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_adapter_call("oidc", "complete_callback", true);
        record_adapter_call("oidc", "refresh", false);
        record_refresh("background", "refresh_unavailable");

        let output = handle.render();
        assert!(output.contains("provider=\"oidc\""));
        assert!(output.contains("operation=\"complete_callback\""));
        assert!(output.contains("outcome=\"error\""));
        assert!(output.contains("trigger=\"background\""));
        assert!(output.contains("outcome=\"refresh_unavailable\""));
    }
}
