//! Metrics collection for ChatRelay
//!
//! This module provides Prometheus metrics for observability.
//! Dropped and failed messages are counted so that message loss is visible
//! to operators even though the caller never hears about it.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for ChatRelay
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub relay: RelayMetrics,
    pub pool: PoolMetrics,
}

/// Message-level metrics
#[derive(Debug, Clone)]
pub struct RelayMetrics {
    /// Deliveries taken off the request queue
    pub messages_received: IntCounter,

    /// Responses published
    pub responses_published: IntCounter,

    /// Malformed messages dropped
    pub messages_dropped: IntCounter,

    /// Generation calls that failed
    pub generation_failures: IntCounter,

    /// Responses that could not be published
    pub publish_failures: IntCounter,

    /// Failed requests forwarded to the dead letter queue
    pub dead_lettered: IntCounter,

    /// Exchange records that could not be stored
    pub store_failures: IntCounter,

    /// Generation call duration
    pub generation_duration: Histogram,
}

/// Worker pool metrics
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Time deliveries wait between consumer and pool slot
    pub queue_time: Histogram,

    /// Deliveries buffered in the pool channel
    pub queue_depth: IntGauge,

    /// Slots currently processing a message
    pub in_flight: IntGauge,

    /// Handlers that panicked mid-delivery
    pub handler_panics: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(gauge.clone()))
        .expect("metric registered once");
    gauge
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("valid histogram definition");
    registry
        .register(Box::new(histogram.clone()))
        .expect("metric registered once");
    histogram
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let relay = RelayMetrics {
            messages_received: counter(
                &registry,
                "relay_messages_received_total",
                "Total number of deliveries taken off the request queue",
            ),
            responses_published: counter(
                &registry,
                "relay_responses_published_total",
                "Total number of responses published",
            ),
            messages_dropped: counter(
                &registry,
                "relay_messages_dropped_total",
                "Total number of malformed messages dropped",
            ),
            generation_failures: counter(
                &registry,
                "relay_generation_failures_total",
                "Total number of failed generation calls",
            ),
            publish_failures: counter(
                &registry,
                "relay_publish_failures_total",
                "Total number of responses that could not be published",
            ),
            dead_lettered: counter(
                &registry,
                "relay_dead_lettered_total",
                "Total number of requests forwarded to the dead letter queue",
            ),
            store_failures: counter(
                &registry,
                "relay_store_failures_total",
                "Total number of exchange records that could not be stored",
            ),
            generation_duration: histogram(
                &registry,
                "relay_generation_duration_seconds",
                "Generation call duration in seconds",
                vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0],
            ),
        };

        let pool = PoolMetrics {
            queue_time: histogram(
                &registry,
                "pool_queue_time_seconds",
                "Time deliveries wait before a pool slot picks them up",
                vec![0.0001, 0.001, 0.01, 0.1, 1.0, 10.0, 60.0],
            ),
            queue_depth: gauge(
                &registry,
                "pool_queue_depth",
                "Current number of deliveries buffered for the pool",
            ),
            in_flight: gauge(
                &registry,
                "pool_in_flight",
                "Current number of messages being processed",
            ),
            handler_panics: counter(
                &registry,
                "pool_handler_panics_total",
                "Total number of deliveries whose handler panicked",
            ),
        };

        MetricsRegistry {
            registry,
            relay,
            pool,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a future
    fn observe_async<F, R>(&self, f: F) -> impl std::future::Future<Output = R> + Send
    where
        F: std::future::Future<Output = R> + Send,
        R: Send;
}

impl LatencyTimer for Histogram {
    async fn observe_async<F, R>(&self, f: F) -> R
    where
        F: std::future::Future<Output = R> + Send,
        R: Send,
    {
        let start = std::time::Instant::now();
        let result = f.await;
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
