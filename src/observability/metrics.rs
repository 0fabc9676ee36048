//! Metrics collection.
//!
//! Prometheus-compatible counters and gauges for the service plane, with
//! label cardinality protection: request methods are bucketed against a
//! known-method list so attacker-controlled method names cannot blow up
//! the label space.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{GatewayError, Result};

/// Guard against double-installing the global recorder.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Tool-protocol methods accepted as metric labels verbatim.
const KNOWN_METHODS: [&str; 10] = [
    "initialize",
    "ping",
    "tools/list",
    "tools/call",
    "resources/list",
    "resources/read",
    "prompts/list",
    "prompts/get",
    "logging/setLevel",
    "completion/complete",
];

/// Buckets unknown methods as `__other__` to cap label cardinality.
#[must_use]
pub fn sanitize_method_label(method: &str) -> &str {
    if KNOWN_METHODS.contains(&method) {
        method
    } else {
        "__other__"
    }
}

/// Installs the global recorder, with a Prometheus HTTP listener on
/// `127.0.0.1:<port>` when a port is given.
///
/// # Errors
///
/// I/O error when the recorder or listener cannot be installed.
pub fn init_metrics(port: Option<u16>) -> Result<()> {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        tracing::debug!("metrics already initialized, skipping");
        return Ok(());
    }
    port.map_or_else(
        || PrometheusBuilder::new().install_recorder().map(|_| ()),
        |p| {
            PrometheusBuilder::new()
                .with_http_listener(([127, 0, 0, 1], p))
                .install()
        },
    )
    .map_err(|e| GatewayError::Internal(format!("metrics recorder install failed: {e}")))?;

    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_counter!("toolgate_requests_total", "Requests accepted by the HTTP surface");
    describe_histogram!("toolgate_request_duration_ms", "End-to-end request duration");
    describe_counter!("toolgate_route_decisions_total", "Routing decisions by strategy and outcome");
    describe_counter!("toolgate_breaker_transitions_total", "Circuit breaker transitions");
    describe_counter!("toolgate_probe_failures_total", "Failed health probes");
    describe_gauge!("toolgate_instances", "Live service instances");
    describe_counter!("toolgate_proxy_total", "Envelopes relayed to backends");
    describe_gauge!("toolgate_uptime_seconds", "Gateway uptime");
}

/// Records one accepted HTTP request.
pub fn record_request(method: &str) {
    let label = sanitize_method_label(method);
    counter!("toolgate_requests_total", "method" => label.to_owned()).increment(1);
}

/// Records end-to-end request duration.
pub fn record_request_duration(method: &str, duration: Duration) {
    let label = sanitize_method_label(method);
    histogram!("toolgate_request_duration_ms", "method" => label.to_owned())
        .record(duration.as_secs_f64() * 1000.0);
}

/// Records one routing decision.
pub fn record_route(strategy: &str, ok: bool) {
    counter!(
        "toolgate_route_decisions_total",
        "strategy" => strategy.to_owned(),
        "outcome" => if ok { "selected" } else { "unroutable" },
    )
    .increment(1);
}

/// Records a breaker transition.
pub fn record_breaker_transition(from: &str, to: &str) {
    counter!(
        "toolgate_breaker_transitions_total",
        "from" => from.to_owned(),
        "to" => to.to_owned(),
    )
    .increment(1);
}

/// Records a failed health probe.
pub fn record_probe_failure() {
    counter!("toolgate_probe_failures_total").increment(1);
}

/// Records one relayed envelope.
pub fn record_proxy(method: &str, ok: bool) {
    let label = sanitize_method_label(method);
    counter!(
        "toolgate_proxy_total",
        "method" => label.to_owned(),
        "outcome" => if ok { "ok" } else { "error" },
    )
    .increment(1);
}

/// Sets the live-instance gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_instances(count: usize) {
    gauge!("toolgate_instances").set(count as f64);
}

/// Sets the uptime gauge.
pub fn set_uptime(duration: Duration) {
    gauge!("toolgate_uptime_seconds").set(duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_methods_pass_through() {
        for method in &KNOWN_METHODS {
            assert_eq!(sanitize_method_label(method), *method);
        }
    }

    #[test]
    fn unknown_methods_bucketed() {
        assert_eq!(sanitize_method_label("x/evil"), "__other__");
        assert_eq!(sanitize_method_label(""), "__other__");
        let long = "m".repeat(10_000);
        assert_eq!(sanitize_method_label(&long), "__other__");
    }

    #[test]
    fn record_functions_are_safe_without_recorder() {
        record_request("tools/call");
        record_request_duration("tools/call", Duration::from_millis(3));
        record_route("round-robin", true);
        record_breaker_transition("closed", "open");
        record_probe_failure();
        record_proxy("tools/call", false);
        set_instances(2);
        set_uptime(Duration::from_secs(60));
    }
}
