//! Pool usage counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Point-in-time view of one pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolMetrics {
    pub active_connections: usize,
    pub idle_connections: usize,
    pub total_connections: usize,
    pub waiting_requests: u64,
    pub average_wait_time_ms: f64,
    pub connection_errors: u64,
    pub requests_served: u64,
    pub average_response_time_ms: f64,
    pub uptime_secs: u64,
}

#[derive(Default)]
struct Averages {
    wait_ms: f64,
    response_ms: f64,
}

/// Accumulating counters. Averages are cumulative moving averages.
#[derive(Default)]
pub(crate) struct PoolCounters {
    pub waiting_requests: AtomicU64,
    pub connection_errors: AtomicU64,
    pub requests_served: AtomicU64,
    acquisitions: AtomicU64,
    averages: Mutex<Averages>,
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl PoolCounters {
    pub fn record_wait(&self, waited: Duration) {
        let n = self.acquisitions.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut avg) = self.averages.lock() {
            avg.wait_ms += (millis(waited) - avg.wait_ms) / n as f64;
        }
    }

    pub fn record_response(&self, elapsed: Duration, ok: bool) {
        let n = self.requests_served.fetch_add(1, Ordering::Relaxed) + 1;
        if !ok {
            self.connection_errors.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut avg) = self.averages.lock() {
            avg.response_ms += (millis(elapsed) - avg.response_ms) / n as f64;
        }
    }

    pub fn snapshot(
        &self,
        active: usize,
        total: usize,
        uptime: Duration,
    ) -> PoolMetrics {
        let (wait_ms, response_ms) = self
            .averages
            .lock()
            .map(|a| (a.wait_ms, a.response_ms))
            .unwrap_or((0.0, 0.0));

        PoolMetrics {
            active_connections: active,
            idle_connections: total.saturating_sub(active),
            total_connections: total,
            waiting_requests: self.waiting_requests.load(Ordering::Relaxed),
            average_wait_time_ms: wait_ms,
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            average_response_time_ms: response_ms,
            uptime_secs: uptime.as_secs(),
        }
    }
}
