//! Metrics and observability support for the caching proxy.
//!
//! Prometheus metrics for monitoring cache effectiveness, invalidation
//! traffic, and SWR refresh health.
//!
//! # Metrics Exposed
//!
//! - `graphql_cache_requests_total` - GraphQL requests by caching status (hit, miss, pass)
//! - `graphql_cache_request_duration_seconds` - Request latency histogram by operation kind
//! - `graphql_cache_invalidations_total` - Tag invalidations by trigger (mutation, admin, schema)
//! - `graphql_cache_swr_refresh_total` - Background refreshes by outcome (stored, failed, skipped)

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};
use std::time::Instant;

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics registry for the proxy
static METRICS: Lazy<CacheMetrics> = Lazy::new(CacheMetrics::new);

/// Cache metrics for Prometheus monitoring.
#[derive(Clone)]
pub struct CacheMetrics {
    /// GraphQL requests by caching status (hit, miss, pass)
    pub cache_requests: IntCounterVec,
    /// Request duration in seconds by operation kind
    pub request_duration: HistogramVec,
    /// Tag invalidations by trigger
    pub invalidations: IntCounterVec,
    /// SWR refreshes by outcome
    pub swr_refreshes: IntCounterVec,
}

impl CacheMetrics {
    /// Create a new metrics instance with registered Prometheus metrics
    pub fn new() -> Self {
        Self {
            cache_requests: register_int_counter_vec!(
                "graphql_cache_requests_total",
                "Total number of GraphQL requests by caching status",
                &["status"]
            )
            .expect("metric can be created"),

            request_duration: register_histogram_vec!(
                "graphql_cache_request_duration_seconds",
                "GraphQL request duration in seconds",
                &["operation"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("metric can be created"),

            invalidations: register_int_counter_vec!(
                "graphql_cache_invalidations_total",
                "Total number of tag invalidations by trigger",
                &["trigger"]
            )
            .expect("metric can be created"),

            swr_refreshes: register_int_counter_vec!(
                "graphql_cache_swr_refresh_total",
                "Total number of stale-while-revalidate refreshes by outcome",
                &["outcome"]
            )
            .expect("metric can be created"),
        }
    }

    /// Get the global metrics instance
    pub fn global() -> &'static Self {
        &METRICS
    }

    /// Record a request resolution by caching status (`hit`, `miss`, `pass`)
    pub fn record_cache_status(&self, status: &str) {
        self.cache_requests.with_label_values(&[status]).inc();
    }

    /// Record a tag invalidation by trigger (`mutation`, `admin`, `schema`)
    pub fn record_invalidation(&self, trigger: &str) {
        self.invalidations.with_label_values(&[trigger]).inc();
    }

    /// Record an SWR refresh outcome (`stored`, `failed`, `skipped`)
    pub fn record_swr_refresh(&self, outcome: &str) {
        self.swr_refreshes.with_label_values(&[outcome]).inc();
    }

    /// Total requests seen across all caching statuses
    pub fn requests_total(&self) -> u64 {
        ["hit", "miss", "pass"]
            .iter()
            .map(|status| self.cache_requests.with_label_values(&[status]).get())
            .sum()
    }

    /// Render all metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .expect("encoding metrics");
        String::from_utf8(buffer).expect("valid utf8")
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A timer that records request duration to the histogram when dropped
pub struct RequestTimer {
    start: Instant,
    operation: String,
    metrics: &'static CacheMetrics,
}

impl RequestTimer {
    /// Start a new request timer for the given operation kind
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            operation: operation.into(),
            metrics: CacheMetrics::global(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metrics
            .request_duration
            .with_label_values(&[&self.operation])
            .observe(duration);
    }
}
