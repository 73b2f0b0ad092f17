use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{OperationStatus, PerformanceMetric};

/// Aggregate view of one `(repository, operation)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub repository: String,
    pub operation: String,
    pub count: u64,
    pub total_duration_ms: f64,
    pub average_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub error_count: u64,
    pub error_rate: f64,
    pub last_updated: DateTime<Utc>,
}

/// `sorted[ceil(p/100 * n) - 1]`, clamped into the slice. Empty input yields 0.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as i64 - 1;
    let idx = rank.clamp(0, sorted.len() as i64 - 1) as usize;
    sorted[idx]
}

/// Running totals plus a bounded window of recent successful durations.
#[derive(Debug)]
pub(crate) struct StatsAccumulator {
    count: u64,
    total_ms: f64,
    min_ms: f64,
    max_ms: f64,
    errors: u64,
    window: VecDeque<f64>,
    window_capacity: usize,
    last_updated: DateTime<Utc>,
}

impl StatsAccumulator {
    pub(crate) fn new(window_capacity: usize) -> Self {
        Self {
            count: 0,
            total_ms: 0.0,
            min_ms: f64::INFINITY,
            max_ms: 0.0,
            errors: 0,
            window: VecDeque::with_capacity(window_capacity.min(1024)),
            window_capacity: window_capacity.max(1),
            last_updated: Utc::now(),
        }
    }

    pub(crate) fn record(&mut self, metric: &PerformanceMetric) {
        self.count += 1;
        self.total_ms += metric.duration_ms;
        self.min_ms = self.min_ms.min(metric.duration_ms);
        self.max_ms = self.max_ms.max(metric.duration_ms);
        self.last_updated = metric.timestamp;

        match metric.status {
            OperationStatus::Success => {
                if self.window.len() == self.window_capacity {
                    self.window.pop_front();
                }
                self.window.push_back(metric.duration_ms);
            }
            OperationStatus::Error => self.errors += 1,
        }
    }

    pub(crate) fn average_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms / self.count as f64
        }
    }

    pub(crate) fn snapshot(&self, repository: &str, operation: &str) -> PerformanceStats {
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);

        PerformanceStats {
            repository: repository.to_string(),
            operation: operation.to_string(),
            count: self.count,
            total_duration_ms: self.total_ms,
            average_duration_ms: self.average_ms(),
            min_duration_ms: if self.count == 0 { 0.0 } else { self.min_ms },
            max_duration_ms: self.max_ms,
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
            error_count: self.errors,
            error_rate: if self.count == 0 {
                0.0
            } else {
                self.errors as f64 / self.count as f64
            },
            last_updated: self.last_updated,
        }
    }
}
