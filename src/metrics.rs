//! Request metrics for production monitoring
//!
//! Tracks request counts, generated tokens and cumulative latency with
//! atomics; exposed in Prometheus text format on `GET /metrics`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Central metrics collector shared across handlers.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    total_requests: Arc<AtomicUsize>,
    successful_requests: Arc<AtomicUsize>,
    failed_requests: Arc<AtomicUsize>,
    total_tokens: Arc<AtomicUsize>,
    total_inference_time_us: Arc<AtomicU64>,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a new metrics collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            total_requests: Arc::new(AtomicUsize::new(0)),
            successful_requests: Arc::new(AtomicUsize::new(0)),
            failed_requests: Arc::new(AtomicUsize::new(0)),
            total_tokens: Arc::new(AtomicUsize::new(0)),
            total_inference_time_us: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    /// Record a successful request.
    pub fn record_success(&self, tokens: usize, duration: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.total_tokens.fetch_add(tokens, Ordering::Relaxed);
        self.total_inference_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a failed request.
    pub fn record_failure(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Total requests seen so far.
    #[must_use]
    pub fn total_requests(&self) -> usize {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Export metrics in Prometheus text format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let total = self.total_requests.load(Ordering::Relaxed);
        let ok = self.successful_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let tokens = self.total_tokens.load(Ordering::Relaxed);
        let time_us = self.total_inference_time_us.load(Ordering::Relaxed);
        let uptime = self.start_time.elapsed().as_secs();

        format!(
            "# HELP servir_requests_total Total number of requests\n\
             # TYPE servir_requests_total counter\n\
             servir_requests_total {total}\n\
             # HELP servir_requests_successful Successful requests\n\
             # TYPE servir_requests_successful counter\n\
             servir_requests_successful {ok}\n\
             # HELP servir_requests_failed Failed requests\n\
             # TYPE servir_requests_failed counter\n\
             servir_requests_failed {failed}\n\
             # HELP servir_tokens_generated Total tokens generated\n\
             # TYPE servir_tokens_generated counter\n\
             servir_tokens_generated {tokens}\n\
             # HELP servir_inference_time_us Cumulative inference time in microseconds\n\
             # TYPE servir_inference_time_us counter\n\
             servir_inference_time_us {time_us}\n\
             # HELP servir_uptime_seconds Server uptime in seconds\n\
             # TYPE servir_uptime_seconds gauge\n\
             servir_uptime_seconds {uptime}\n"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_success_and_failure() {
        let metrics = MetricsCollector::new();
        metrics.record_success(10, Duration::from_millis(5));
        metrics.record_success(7, Duration::from_millis(3));
        metrics.record_failure();

        assert_eq!(metrics.total_requests(), 3);
        let text = metrics.to_prometheus();
        assert!(text.contains("servir_requests_total 3"));
        assert!(text.contains("servir_requests_successful 2"));
        assert!(text.contains("servir_requests_failed 1"));
        assert!(text.contains("servir_tokens_generated 17"));
    }

    #[test]
    fn test_clone_shares_counters() {
        let metrics = MetricsCollector::new();
        let clone = metrics.clone();
        clone.record_failure();
        assert_eq!(metrics.total_requests(), 1);
    }
}
