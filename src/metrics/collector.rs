//! Metrics collector using prometheus-client.
//!
//! Provides metrics for requests, connections, health check failures and the
//! lifecycle phase the server has reached.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Labels for request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub route: String,
    pub method: String,
    pub status: String,
}

/// Labels for request duration metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
    pub route: String,
}

/// Labels for lifecycle signal metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SignalLabels {
    pub signal: String,
}

/// Labels for health check failure metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthCheckLabels {
    pub endpoint: String,
    pub check: String,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Total requests counter.
    requests_total: Family<RequestLabels, Counter>,
    /// Request duration histogram (in seconds).
    request_duration_seconds: Family<RouteLabels, Histogram>,
    /// Active connections gauge.
    active_connections: Gauge,
    /// Total connections counter.
    connections_total: Counter,
    /// Connections aborted because the drain deadline passed.
    connections_aborted_total: Counter,
    /// Lifecycle signal gauge (1 = fired, 0 = not yet).
    lifecycle_signal: Family<SignalLabels, Gauge>,
    /// Failed health checks counter.
    health_check_failures_total: Family<HealthCheckLabels, Counter>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        let request_duration_seconds = Family::<RouteLabels, Histogram>::new_with_constructor(
            || {
                // Buckets: 1ms .. ~60s
                Histogram::new(exponential_buckets(0.001, 2.5, 13))
            },
        );
        let active_connections = Gauge::default();
        let connections_total = Counter::default();
        let connections_aborted_total = Counter::default();
        let lifecycle_signal = Family::<SignalLabels, Gauge>::default();
        let health_check_failures_total = Family::<HealthCheckLabels, Counter>::default();

        registry.register(
            "apiserve_requests",
            "Total number of requests processed",
            requests_total.clone(),
        );
        registry.register(
            "apiserve_request_duration_seconds",
            "Request duration in seconds",
            request_duration_seconds.clone(),
        );
        registry.register(
            "apiserve_active_connections",
            "Number of open client connections",
            active_connections.clone(),
        );
        registry.register(
            "apiserve_connections",
            "Total number of accepted connections",
            connections_total.clone(),
        );
        registry.register(
            "apiserve_connections_aborted",
            "Connections forcibly closed after the shutdown timeout",
            connections_aborted_total.clone(),
        );
        registry.register(
            "apiserve_lifecycle_signal",
            "Lifecycle signal state (1=fired, 0=not fired)",
            lifecycle_signal.clone(),
        );
        registry.register(
            "apiserve_health_check_failures",
            "Total number of failed health checks",
            health_check_failures_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                requests_total,
                request_duration_seconds,
                active_connections,
                connections_total,
                connections_aborted_total,
                lifecycle_signal,
                health_check_failures_total,
                registry,
            }),
        }
    }

    /// Record a completed request.
    pub fn record_request(&self, route: &str, method: &str, status: u16, duration: Duration) {
        self.count_request(route, method, status);

        let route_labels = RouteLabels {
            route: route.to_string(),
        };
        self.inner
            .request_duration_seconds
            .get_or_create(&route_labels)
            .observe(duration.as_secs_f64());
    }

    /// Record a request answered without reaching an endpoint (unknown
    /// path, or refused during shutdown). Only the request counter moves.
    pub fn record_rejected(&self, route: &str, method: &str, status: u16) {
        self.count_request(route, method, status);
    }

    fn count_request(&self, route: &str, method: &str, status: u16) {
        let labels = RequestLabels {
            route: route.to_string(),
            method: method.to_string(),
            status: status.to_string(),
        };
        self.inner.requests_total.get_or_create(&labels).inc();
    }

    /// Increment active connections.
    pub fn connection_opened(&self) {
        self.inner.active_connections.inc();
        self.inner.connections_total.inc();
    }

    /// Decrement active connections.
    pub fn connection_closed(&self) {
        self.inner.active_connections.dec();
    }

    /// Record connections aborted at the drain deadline.
    pub fn connections_aborted(&self, count: u64) {
        self.inner.connections_aborted_total.inc_by(count);
    }

    /// Record the state of a lifecycle signal.
    pub fn set_signal(&self, signal: &str, fired: bool) {
        let labels = SignalLabels {
            signal: signal.to_string(),
        };
        self.inner
            .lifecycle_signal
            .get_or_create(&labels)
            .set(if fired { 1 } else { 0 });
    }

    /// Record a failed health check.
    pub fn record_health_check_failure(&self, endpoint: &str, check: &str) {
        let labels = HealthCheckLabels {
            endpoint: endpoint.to_string(),
            check: check.to_string(),
        };
        self.inner
            .health_check_failures_total
            .get_or_create(&labels)
            .inc();
    }

    /// Start timing a request.
    pub fn start_request_timer(&self, route: &str) -> RequestTimer {
        RequestTimer {
            collector: self.clone(),
            route: route.to_string(),
            start: Instant::now(),
        }
    }

    /// Encode all metrics in prometheus text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.inner.registry)?;
        Ok(buffer)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer that records a request when consumed.
pub struct RequestTimer {
    collector: MetricsCollector,
    route: String,
    start: Instant,
}

impl RequestTimer {
    /// Get the elapsed duration.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record the request and consume the timer.
    pub fn record(self, method: &str, status: u16) {
        let duration = self.start.elapsed();
        self.collector
            .record_request(&self.route, method, status, duration);
    }
}
