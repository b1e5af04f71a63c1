//! Metrics aggregation
//!
//! Concurrency-safe counters plus min/avg/max of response time. The engine's
//! timing wrapper is the only writer; handlers never touch the aggregator.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Point-in-time copy of the aggregated metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Sum of all recorded spans in microseconds
    pub total_response_time_us: u64,
    /// Smallest recorded span; zero until the first sample
    pub min_response_time_us: u64,
    /// Largest recorded span
    pub max_response_time_us: u64,
    /// successful / (total_response_time_s * worker_count)
    pub requests_per_second: f64,
}

impl MetricsSnapshot {
    /// Mean span across all recorded requests, zero when empty
    pub fn avg_response_time_us(&self) -> u64 {
        if self.total_requests == 0 {
            0
        } else {
            self.total_response_time_us / self.total_requests
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    total_response_time_us: u64,
    min_response_time_us: u64,
    max_response_time_us: u64,
}

/// Mutex-guarded aggregator shared by all workers
#[derive(Debug)]
pub struct MetricsAggregator {
    counters: Mutex<Counters>,
    worker_count: usize,
}

impl MetricsAggregator {
    /// Create an aggregator; `worker_count` feeds the derived rate
    pub fn new(worker_count: usize) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            worker_count,
        }
    }

    /// Record one completed request.
    ///
    /// The zero sentinel on `min` is replaced by the first sample.
    pub fn record(&self, elapsed_us: u64, success: bool) {
        let mut c = self.counters.lock().expect("metrics mutex poisoned");

        c.total_requests += 1;
        if success {
            c.successful_requests += 1;
        } else {
            c.failed_requests += 1;
        }

        c.total_response_time_us += elapsed_us;

        if c.min_response_time_us == 0 || elapsed_us < c.min_response_time_us {
            c.min_response_time_us = elapsed_us;
        }
        if elapsed_us > c.max_response_time_us {
            c.max_response_time_us = elapsed_us;
        }
    }

    /// Consistent copy of the counters with the derived rate computed
    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = self.counters.lock().expect("metrics mutex poisoned");

        let requests_per_second = if c.total_requests > 0 && c.total_response_time_us > 0 {
            c.successful_requests as f64
                / (c.total_response_time_us as f64 / 1_000_000.0 * self.worker_count as f64)
        } else {
            0.0
        };

        MetricsSnapshot {
            total_requests: c.total_requests,
            successful_requests: c.successful_requests,
            failed_requests: c.failed_requests,
            total_response_time_us: c.total_response_time_us,
            min_response_time_us: c.min_response_time_us,
            max_response_time_us: c.max_response_time_us,
            requests_per_second,
        }
    }

    /// Zero all counters
    pub fn reset(&self) {
        let mut c = self.counters.lock().expect("metrics mutex poisoned");
        *c = Counters::default();
    }
}
