//! Request counters for the HTTP client.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::RwLock;

const LATENCY_WINDOW: usize = 1000;

/// Counters updated by [`HttpClient`](crate::http::HttpClient).
#[derive(Debug)]
pub struct ClientMetrics {
    requests_sent: AtomicU64,
    requests_successful: AtomicU64,
    requests_failed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    response_times: RwLock<VecDeque<Duration>>,
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`ClientMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub requests_sent: u64,
    pub requests_successful: u64,
    pub requests_failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub avg_response_time: Duration,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self {
            requests_sent: AtomicU64::new(0),
            requests_successful: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            response_times: RwLock::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        }
    }

    pub(crate) fn record_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self, duration: Duration) {
        self.requests_successful.fetch_add(1, Ordering::Relaxed);
        self.update_response_time(duration);
    }

    pub(crate) fn record_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn update_response_time(&self, duration: Duration) {
        if let Some(mut times) = self.response_times.try_write() {
            if times.len() >= LATENCY_WINDOW {
                times.pop_front();
            }
            times.push_back(duration);
        }
    }

    /// Mean latency over the most recent successful requests.
    pub fn avg_response_time(&self) -> Duration {
        let times = self.response_times.read();
        if times.is_empty() {
            Duration::ZERO
        } else {
            let total: Duration = times.iter().sum();
            total / times.len() as u32
        }
    }

    /// Fraction of sent requests that failed.
    pub fn error_rate(&self) -> f64 {
        let total = self.requests_sent.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            self.requests_failed.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    /// Fraction of cacheable lookups served from the cache.
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let total = hits + self.cache_misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            requests_successful: self.requests_successful.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            avg_response_time: self.avg_response_time(),
        }
    }
}
