//! Metrics collection for BatchLoop
//!
//! This module provides Prometheus metrics for observability.
//! All metrics are carefully designed to minimize overhead in the hot path.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for BatchLoop
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub requests: RequestMetrics,
    pub scheduler: SchedulerMetrics,
}

/// Per-request metrics, recorded by the HTTP front end
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    /// Total number of requests
    pub requests_total: IntCounter,

    /// Total number of successful requests
    pub requests_success: IntCounter,

    /// Total number of failed requests
    pub requests_failed: IntCounter,

    /// Request duration histogram
    pub request_duration: Histogram,

    /// Current active requests
    pub active_requests: IntGauge,

    /// Streamed chunks written to clients
    pub chunks_streamed_total: IntCounter,
}

/// Scheduler and worker metrics
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
    /// Current queue depth
    pub queue_depth: IntGauge,

    /// Queue wait time
    pub queue_time: Histogram,

    /// Batch size histogram
    pub batch_size: Histogram,

    /// Predict routine duration per batch
    pub predict_duration: Histogram,

    /// Batches aborted by a failing predict routine
    pub failed_batches: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(counter.clone()))
        .expect("counter registered once");
    counter
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(gauge.clone()))
        .expect("gauge registered once");
    gauge
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("valid histogram definition");
    registry
        .register(Box::new(histogram.clone()))
        .expect("histogram registered once");
    histogram
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let requests = RequestMetrics {
            requests_total: counter(
                &registry,
                "batchloop_requests_total",
                "Total number of prediction requests",
            ),
            requests_success: counter(
                &registry,
                "batchloop_requests_success_total",
                "Total number of successful prediction requests",
            ),
            requests_failed: counter(
                &registry,
                "batchloop_requests_failed_total",
                "Total number of failed prediction requests",
            ),
            request_duration: histogram(
                &registry,
                "batchloop_request_duration_seconds",
                "Request duration in seconds",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            ),
            active_requests: gauge(
                &registry,
                "batchloop_active_requests",
                "Current number of active requests",
            ),
            chunks_streamed_total: counter(
                &registry,
                "batchloop_chunks_streamed_total",
                "Total number of streamed chunks written to clients",
            ),
        };

        let scheduler = SchedulerMetrics {
            queue_depth: gauge(
                &registry,
                "batchloop_queue_depth",
                "Current depth of the intake queue",
            ),
            queue_time: histogram(
                &registry,
                "batchloop_queue_time_seconds",
                "Time requests spend in queue before dispatch",
                vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1],
            ),
            batch_size: histogram(
                &registry,
                "batchloop_batch_size",
                "Batch size distribution",
                vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0],
            ),
            predict_duration: histogram(
                &registry,
                "batchloop_predict_duration_seconds",
                "Predict routine duration per batch in seconds",
                vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
            ),
            failed_batches: counter(
                &registry,
                "batchloop_failed_batches_total",
                "Batches aborted by a failing predict routine",
            ),
        };

        MetricsRegistry {
            registry,
            requests,
            scheduler,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# failed to encode metrics: {}\n", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
