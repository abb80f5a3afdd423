use crate::error::BalancerError;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the Prometheus recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    ///
    /// Fails if a global recorder is already installed.
    pub fn install() -> Result<Self, BalancerError> {
        let handle = builder()?
            .install_recorder()
            .map_err(|e| BalancerError::Internal(format!("metrics recorder: {}", e)))?;
        describe_all();
        Ok(Self { handle })
    }

    /// A recorder that is not installed globally. Renders only the default
    /// exposition (nothing recorded through the macros reaches it).
    pub fn detached() -> Result<Self, BalancerError> {
        let recorder = builder()?.build_recorder();
        Ok(Self {
            handle: recorder.handle(),
        })
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn builder() -> Result<PrometheusBuilder, BalancerError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )
        .map_err(|e| BalancerError::Internal(format!("metrics buckets: {}", e)))
}

fn describe_all() {
    // request path
    describe_counter!(
        "lb_http_requests_total",
        Unit::Count,
        "Total HTTP requests processed"
    );
    describe_histogram!(
        "lb_http_request_duration_seconds",
        Unit::Seconds,
        "Total request duration from client perspective"
    );
    describe_histogram!(
        "lb_upstream_request_duration_seconds",
        Unit::Seconds,
        "Time from forwarding a request to the upstream response head"
    );
    describe_counter!(
        "lb_upstream_errors_total",
        Unit::Count,
        "Upstream failures answered with 502"
    );
    describe_counter!(
        "lb_no_backend_total",
        Unit::Count,
        "Requests answered with 503 because no backend was healthy"
    );

    // membership
    describe_gauge!(
        "lb_backends",
        Unit::Count,
        "Backends in the current snapshot, by state"
    );
    describe_counter!(
        "lb_consul_poll_total",
        Unit::Count,
        "Consul blocking query attempts"
    );
    describe_counter!(
        "lb_health_check_total",
        Unit::Count,
        "Active health check attempts"
    );

    // connections
    describe_gauge!(
        "lb_connections_active",
        Unit::Count,
        "Number of active downstream connections"
    );
    describe_counter!(
        "lb_connections_total",
        Unit::Count,
        "Total connections accepted"
    );
}
