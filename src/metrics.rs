//! Prometheus metrics for dispatchers and the routing layer.
//!
//! Metrics cover:
//! - Log consumption (events consumed, consumer reconnects, commit failures)
//! - Fan-out (events delivered, events dropped by slow sessions, live sessions)
//! - Dispatcher lifecycle state
//! - Routing (requests by outcome, resolver cache hits/misses)
//! - Provisioning (attempts, outcomes, duration) and registry state counts
//! - Retries at collaborator boundaries
//!
//! All metrics live in a custom registry with the "assetstream" prefix so they
//! never collide with the default Prometheus registry.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for assetstream metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("assetstream".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Dispatcher metrics
// =============================================================================

define_counter_vec!(
    EVENTS_CONSUMED,
    "events_consumed_total",
    "Events read from a group's derived log",
    ["group"]
);
define_counter_vec!(
    EVENTS_DELIVERED,
    "events_delivered_total",
    "Events queued for delivery to sessions",
    ["group"]
);
define_counter_vec!(
    EVENTS_DROPPED,
    "events_dropped_total",
    "Events dropped from full session queues",
    ["group"]
);
define_counter_vec!(
    UNDECODABLE_RECORDS,
    "undecodable_records_total",
    "Log records skipped because they could not be decoded",
    ["group"]
);
define_gauge_vec!(
    ACTIVE_SESSIONS,
    "active_sessions",
    "Live subscription sessions",
    ["group"]
);
define_gauge_vec!(
    DISPATCHER_STATE,
    "dispatcher_state",
    "Dispatcher lifecycle state (0=starting, 1=consuming, 2=draining, 3=stopped)",
    ["group"]
);
define_counter_vec!(
    CONSUMER_RECONNECTS,
    "consumer_reconnects_total",
    "Log consumer reconnect attempts",
    ["group", "status"]
);
define_counter_vec!(
    COMMIT_FAILURES,
    "commit_failures_total",
    "Failed log position commits",
    ["group"]
);

// =============================================================================
// Routing metrics
// =============================================================================

define_counter_vec!(
    ROUTE_REQUESTS,
    "route_requests_total",
    "Routing decisions by outcome",
    ["outcome"]
);
define_counter!(
    RESOLVER_CACHE_HITS,
    "resolver_cache_hits_total",
    "Group resolutions served from cache"
);
define_counter!(
    RESOLVER_CACHE_MISSES,
    "resolver_cache_misses_total",
    "Group resolutions that required a metadata lookup"
);
define_counter_vec!(
    PROVISION_ATTEMPTS,
    "provision_attempts_total",
    "Provisioning attempts by outcome",
    ["status"]
);
define_histogram_vec!(
    PROVISION_DURATION,
    "provision_duration_seconds",
    "Time from provisioner start to ready or failure",
    ["status"],
    [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
);
define_gauge_vec!(
    REGISTRY_ENTRIES,
    "registry_entries",
    "Registry entries by lifecycle state",
    ["state"]
);
define_counter_vec!(
    HEALTH_CHECKS,
    "health_checks_total",
    "Registry health revalidations by result",
    ["result"]
);
define_gauge!(
    PROXIED_STREAMS,
    "proxied_streams",
    "Streams currently proxied by the router"
);

// =============================================================================
// Retry metrics
// =============================================================================

define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry attempts by operation",
    ["operation"]
);
define_counter_vec!(
    RETRY_EXHAUSTED,
    "retry_exhausted_total",
    "Operations that failed after all retries",
    ["operation"]
);
define_counter_vec!(
    RETRY_SUCCESS,
    "retry_success_total",
    "Operations that succeeded after at least one retry",
    ["operation"]
);

// =============================================================================
// Registration helpers
// =============================================================================

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
    }
    gauge
}

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
    }
    gauge
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
    }
    counter
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
    }
    counter
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("histogram opts should be valid");
    if let Err(e) = registry.register(Box::new(histogram.clone())) {
        warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
    }
    histogram
}

/// Force registration of every metric so `/metrics` lists them before first use.
pub fn init_metrics() {
    Lazy::force(&EVENTS_CONSUMED);
    Lazy::force(&EVENTS_DELIVERED);
    Lazy::force(&EVENTS_DROPPED);
    Lazy::force(&UNDECODABLE_RECORDS);
    Lazy::force(&ACTIVE_SESSIONS);
    Lazy::force(&DISPATCHER_STATE);
    Lazy::force(&CONSUMER_RECONNECTS);
    Lazy::force(&COMMIT_FAILURES);
    Lazy::force(&ROUTE_REQUESTS);
    Lazy::force(&RESOLVER_CACHE_HITS);
    Lazy::force(&RESOLVER_CACHE_MISSES);
    Lazy::force(&PROVISION_ATTEMPTS);
    Lazy::force(&PROVISION_DURATION);
    Lazy::force(&REGISTRY_ENTRIES);
    Lazy::force(&HEALTH_CHECKS);
    Lazy::force(&PROXIED_STREAMS);
    Lazy::force(&RETRY_ATTEMPTS);
    Lazy::force(&RETRY_EXHAUSTED);
    Lazy::force(&RETRY_SUCCESS);
}

/// Encode all metrics in the Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// =============================================================================
// Recording helpers
// =============================================================================

pub fn record_consumed(group: &str) {
    EVENTS_CONSUMED.with_label_values(&[group]).inc();
}

pub fn record_delivered(group: &str, count: u64) {
    if count > 0 {
        EVENTS_DELIVERED.with_label_values(&[group]).inc_by(count);
    }
}

pub fn record_dropped(group: &str, count: u64) {
    if count > 0 {
        EVENTS_DROPPED.with_label_values(&[group]).inc_by(count);
    }
}

pub fn record_undecodable(group: &str) {
    UNDECODABLE_RECORDS.with_label_values(&[group]).inc();
}

pub fn set_active_sessions(group: &str, count: usize) {
    ACTIVE_SESSIONS
        .with_label_values(&[group])
        .set(count as i64);
}

pub fn set_dispatcher_state(group: &str, state: i64) {
    DISPATCHER_STATE.with_label_values(&[group]).set(state);
}

pub fn record_consumer_reconnect(group: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    CONSUMER_RECONNECTS.with_label_values(&[group, status]).inc();
}

pub fn record_commit_failure(group: &str) {
    COMMIT_FAILURES.with_label_values(&[group]).inc();
}

pub fn record_route(outcome: &str) {
    ROUTE_REQUESTS.with_label_values(&[outcome]).inc();
}

pub fn record_resolver_lookup(hit: bool) {
    if hit {
        RESOLVER_CACHE_HITS.inc();
    } else {
        RESOLVER_CACHE_MISSES.inc();
    }
}

pub fn record_provision(status: &str, duration_secs: f64) {
    PROVISION_ATTEMPTS.with_label_values(&[status]).inc();
    PROVISION_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

pub fn set_registry_entries(state: &str, count: usize) {
    REGISTRY_ENTRIES
        .with_label_values(&[state])
        .set(count as i64);
}

pub fn inc_proxied_streams() {
    PROXIED_STREAMS.inc();
}

pub fn dec_proxied_streams() {
    PROXIED_STREAMS.dec();
}

pub fn record_health_check(healthy: bool) {
    let result = if healthy { "healthy" } else { "unhealthy" };
    HEALTH_CHECKS.with_label_values(&[result]).inc();
}
