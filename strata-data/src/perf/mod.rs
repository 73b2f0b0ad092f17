//! Operation timing, aggregate statistics, threshold alerts and regression checks
//!
//! Instrumentation never fails the operation it measures. Missing timing marks,
//! sink failures and alerts without subscribers are logged and dropped.

mod stats;

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_core::{KvEntry, KvStore, MonitorSettings, ThresholdSettings};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use stats::{percentile, PerformanceStats};
use stats::StatsAccumulator;

pub const METRIC_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const STATS_TTL: Duration = Duration::from_secs(60 * 60);
pub const HISTORY_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub const DEFAULT_THRESHOLDS: ThresholdSettings = ThresholdSettings {
    warning_ms: 1000,
    critical_ms: 5000,
};

const ALERT_CHANNEL_CAPACITY: usize = 256;

/// Error message recorded for a measured future dropped mid-flight
pub const CANCELLED: &str = "operation cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Success,
    Error,
}

/// One completed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub repository: String,
    pub operation: String,
    pub duration_ms: f64,
    pub status: OperationStatus,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_details: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// Emitted when an operation crosses its duration threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub repository: String,
    pub operation: String,
    pub duration_ms: f64,
    pub threshold_ms: u64,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Regression {
    pub repository: String,
    pub operation: String,
    pub historical_average_ms: f64,
    pub current_average_ms: f64,
    /// Fractional increase, e.g. `0.25` for 25%
    pub increase: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    average_duration_ms: f64,
    recorded_at: DateTime<Utc>,
}

type OpKey = (String, String);

pub struct PerformanceMonitor {
    store: Arc<dyn KvStore>,
    settings: MonitorSettings,
    key_prefix: String,
    marks: Mutex<HashMap<String, Instant>>,
    ring: Mutex<VecDeque<PerformanceMetric>>,
    pending: Mutex<Vec<PerformanceMetric>>,
    stats: Mutex<HashMap<OpKey, StatsAccumulator>>,
    thresholds: RwLock<HashMap<OpKey, ThresholdSettings>>,
    alerts: broadcast::Sender<Alert>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

fn mark_name(repository: &str, operation: &str, correlation_id: &str) -> String {
    format!("{repository}:{operation}:{correlation_id}")
}

fn op_key(repository: &str, operation: &str) -> OpKey {
    (repository.to_string(), operation.to_string())
}

/// An open start mark that is closed exactly once, on completion or on drop.
struct Bracket<'a> {
    monitor: &'a PerformanceMonitor,
    repository: &'a str,
    operation: &'a str,
    correlation_id: String,
    open: bool,
}

impl<'a> Bracket<'a> {
    fn open(monitor: &'a PerformanceMonitor, repository: &'a str, operation: &'a str) -> Self {
        let correlation_id = Uuid::new_v4().to_string();
        monitor.start_operation(repository, operation, &correlation_id);
        Self {
            monitor,
            repository,
            operation,
            correlation_id,
            open: true,
        }
    }

    fn close(&mut self, status: OperationStatus, error_message: Option<String>) {
        if !std::mem::replace(&mut self.open, false) {
            return;
        }
        self.monitor.end_operation(
            self.repository,
            self.operation,
            &self.correlation_id,
            status,
            error_message,
            None,
        );
    }
}

impl Drop for Bracket<'_> {
    fn drop(&mut self) {
        if self.open {
            debug!(
                repository = self.repository,
                operation = self.operation,
                correlation_id = %self.correlation_id,
                "measured operation dropped before completion"
            );
            self.close(OperationStatus::Error, Some(CANCELLED.to_string()));
        }
    }
}

impl PerformanceMonitor {
    pub fn new(
        store: Arc<dyn KvStore>,
        settings: MonitorSettings,
        key_prefix: impl Into<String>,
    ) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            store,
            settings,
            key_prefix: key_prefix.into(),
            marks: Mutex::new(HashMap::new()),
            ring: Mutex::new(VecDeque::new()),
            pending: Mutex::new(Vec::new()),
            stats: Mutex::new(HashMap::new()),
            thresholds: RwLock::new(HashMap::new()),
            alerts,
            flush_task: Mutex::new(None),
        }
    }

    /// Receive every alert emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    pub fn set_threshold(&self, repository: &str, operation: &str, threshold: ThresholdSettings) {
        if let Ok(mut map) = self.thresholds.write() {
            map.insert(op_key(repository, operation), threshold);
        }
    }

    /// Configured bounds for the operation, or the 1000/5000 ms defaults.
    pub fn threshold(&self, repository: &str, operation: &str) -> ThresholdSettings {
        self.thresholds
            .read()
            .ok()
            .and_then(|map| map.get(&op_key(repository, operation)).copied())
            .unwrap_or(DEFAULT_THRESHOLDS)
    }

    pub fn start_operation(&self, repository: &str, operation: &str, correlation_id: &str) {
        if let Ok(mut marks) = self.marks.lock() {
            marks.insert(mark_name(repository, operation, correlation_id), Instant::now());
        }
    }

    /// Close the bracket opened by [`start_operation`](Self::start_operation) and record
    /// the metric. Returns `None` (and records nothing) if no start mark exists.
    pub fn end_operation(
        &self,
        repository: &str,
        operation: &str,
        correlation_id: &str,
        status: OperationStatus,
        error_message: Option<String>,
        query_details: Option<Value>,
    ) -> Option<PerformanceMetric> {
        let name = mark_name(repository, operation, correlation_id);
        let started = self.marks.lock().ok().and_then(|mut marks| marks.remove(&name));
        let Some(started) = started else {
            warn!(mark = %name, "no start mark for operation, metric skipped");
            return None;
        };

        let metric = PerformanceMetric {
            repository: repository.to_string(),
            operation: operation.to_string(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            status,
            correlation_id: correlation_id.to_string(),
            timestamp: Utc::now(),
            error_message,
            query_details,
        };
        self.record(metric.clone());
        Some(metric)
    }

    /// Time `fut` under a fresh correlation id. The future's output is returned as is.
    ///
    /// If the returned future is dropped before `fut` completes, the mark is closed
    /// with an error metric so no mark outlives the call.
    pub async fn measure<T, E, Fut>(&self, repository: &str, operation: &str, fut: Fut) -> Result<T, E>
    where
        E: Display,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut bracket = Bracket::open(self, repository, operation);
        let result = fut.await;
        match &result {
            Ok(_) => bracket.close(OperationStatus::Success, None),
            Err(e) => bracket.close(OperationStatus::Error, Some(e.to_string())),
        }
        result
    }

    /// Ingest a completed metric: ring, stats, threshold check and flush buffer.
    pub fn record(&self, metric: PerformanceMetric) {
        if let Ok(mut ring) = self.ring.lock() {
            if ring.len() >= self.settings.ring_capacity.max(2) {
                let half = ring.len() / 2;
                ring.drain(..half);
            }
            ring.push_back(metric.clone());
        }

        if let Ok(mut stats) = self.stats.lock() {
            stats
                .entry(op_key(&metric.repository, &metric.operation))
                .or_insert_with(|| StatsAccumulator::new(self.settings.percentile_window))
                .record(&metric);
        }

        self.check_threshold(&metric);

        let full_batch = self.pending.lock().ok().and_then(|mut pending| {
            pending.push(metric);
            if pending.len() >= self.settings.flush_batch_size.max(1) {
                Some(std::mem::take(&mut *pending))
            } else {
                None
            }
        });
        if let Some(batch) = full_batch {
            self.spawn_write(batch);
        }
    }

    fn check_threshold(&self, metric: &PerformanceMetric) {
        let threshold = self.threshold(&metric.repository, &metric.operation);
        let (level, threshold_ms) = if metric.duration_ms >= threshold.critical_ms as f64 {
            (AlertLevel::Critical, threshold.critical_ms)
        } else if metric.duration_ms >= threshold.warning_ms as f64 {
            (AlertLevel::Warning, threshold.warning_ms)
        } else {
            return;
        };

        match level {
            AlertLevel::Critical => error!(
                repository = %metric.repository,
                operation = %metric.operation,
                duration_ms = metric.duration_ms,
                threshold_ms,
                correlation_id = %metric.correlation_id,
                "operation exceeded critical threshold"
            ),
            AlertLevel::Warning => warn!(
                repository = %metric.repository,
                operation = %metric.operation,
                duration_ms = metric.duration_ms,
                threshold_ms,
                correlation_id = %metric.correlation_id,
                "operation exceeded warning threshold"
            ),
        }

        // No subscribers is fine
        let _ = self.alerts.send(Alert {
            level,
            repository: metric.repository.clone(),
            operation: metric.operation.clone(),
            duration_ms: metric.duration_ms,
            threshold_ms,
            correlation_id: metric.correlation_id.clone(),
            timestamp: metric.timestamp,
        });
    }

    pub fn stats(&self, repository: &str, operation: &str) -> Option<PerformanceStats> {
        let stats = self.stats.lock().ok()?;
        stats
            .get(&op_key(repository, operation))
            .map(|acc| acc.snapshot(repository, operation))
    }

    /// Stats for every pair, sorted by repository then operation.
    pub fn all_stats(&self) -> Vec<PerformanceStats> {
        let Ok(stats) = self.stats.lock() else {
            return Vec::new();
        };
        let mut out: Vec<PerformanceStats> = stats
            .iter()
            .map(|((repo, op), acc)| acc.snapshot(repo, op))
            .collect();
        out.sort_by(|a, b| (&a.repository, &a.operation).cmp(&(&b.repository, &b.operation)));
        out
    }

    /// Slowest operations currently in the ring.
    pub fn slow_queries(&self, limit: usize) -> Vec<PerformanceMetric> {
        let Ok(ring) = self.ring.lock() else {
            return Vec::new();
        };
        let mut all: Vec<PerformanceMetric> = ring.iter().cloned().collect();
        all.sort_by(|a, b| b.duration_ms.total_cmp(&a.duration_ms));
        all.truncate(limit);
        all
    }

    /// Most recent failed operations in the ring, newest first.
    pub fn errored_operations(&self, limit: usize) -> Vec<PerformanceMetric> {
        let Ok(ring) = self.ring.lock() else {
            return Vec::new();
        };
        ring.iter()
            .rev()
            .filter(|m| m.status == OperationStatus::Error)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Compare each pair's current average against its checkpoint, flag increases
    /// above the configured fraction, then move the checkpoint forward.
    pub async fn detect_regressions(&self) -> Vec<Regression> {
        let current: Vec<(OpKey, f64)> = match self.stats.lock() {
            Ok(stats) => stats
                .iter()
                .filter(|(_, acc)| acc.average_ms() > 0.0)
                .map(|(key, acc)| (key.clone(), acc.average_ms()))
                .collect(),
            Err(_) => return Vec::new(),
        };

        let mut regressions = Vec::new();
        for ((repository, operation), average) in current {
            let key = self.history_key(&repository, &operation);

            let historical = match self.store.get(&key).await {
                Ok(raw) => raw.and_then(|raw| serde_json::from_str::<Checkpoint>(&raw).ok()),
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to read performance checkpoint");
                    continue;
                }
            };

            if let Some(historical) = historical.filter(|h| h.average_duration_ms > 0.0) {
                let increase =
                    (average - historical.average_duration_ms) / historical.average_duration_ms;
                if increase > self.settings.regression_threshold {
                    warn!(
                        repository = %repository,
                        operation = %operation,
                        historical_ms = historical.average_duration_ms,
                        current_ms = average,
                        "performance regression detected"
                    );
                    regressions.push(Regression {
                        repository: repository.clone(),
                        operation: operation.clone(),
                        historical_average_ms: historical.average_duration_ms,
                        current_average_ms: average,
                        increase,
                    });
                }
            }

            let checkpoint = Checkpoint {
                average_duration_ms: average,
                recorded_at: Utc::now(),
            };
            match serde_json::to_string(&checkpoint) {
                Ok(raw) => {
                    if let Err(e) = self.store.set_ex(&key, raw, HISTORY_TTL).await {
                        warn!(key = %key, error = %e, "failed to write performance checkpoint");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode performance checkpoint"),
            }
        }
        regressions
    }

    /// Write buffered metrics and the touched stats snapshots to the sink.
    /// Returns how many metrics were flushed.
    pub async fn flush(&self) -> usize {
        let batch = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return 0,
        };
        let count = batch.len();
        if count > 0 {
            write_batch(self.store.as_ref(), self.build_entries(batch)).await;
        }
        count
    }

    /// Flush on the configured interval until shutdown.
    pub fn start_flush_loop(self: &Arc<Self>) {
        let period = self.settings.flush_interval();
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else { break };
                let flushed = monitor.flush().await;
                if flushed > 0 {
                    debug!(flushed, "performance metrics flushed");
                }
            }
        });

        if let Ok(mut slot) = self.flush_task.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Stop the flush loop, drop open timing marks and flush what is left.
    pub async fn shutdown(&self) {
        if let Ok(mut slot) = self.flush_task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        let abandoned = self
            .marks
            .lock()
            .map(|mut marks| marks.drain().count())
            .unwrap_or(0);
        let flushed = self.flush().await;
        info!(flushed, abandoned, "performance monitor stopped");
    }

    fn spawn_write(&self, batch: Vec<PerformanceMetric>) {
        let entries = self.build_entries(batch);
        let store = Arc::clone(&self.store);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { write_batch(store.as_ref(), entries).await });
            }
            Err(_) => warn!(
                dropped = entries.len(),
                "no runtime available, performance metrics dropped"
            ),
        }
    }

    fn build_entries(&self, batch: Vec<PerformanceMetric>) -> Vec<KvEntry> {
        let mut touched: Vec<OpKey> = Vec::new();
        let mut entries = Vec::with_capacity(batch.len() + 1);

        for metric in &batch {
            let key = format!(
                "{}perf:metrics:{}:{}:{}:{}",
                self.key_prefix,
                metric.repository,
                metric.operation,
                metric.timestamp.timestamp_millis(),
                metric.correlation_id
            );
            match serde_json::to_string(metric) {
                Ok(raw) => entries.push(KvEntry::new(key, raw, METRIC_TTL)),
                Err(e) => warn!(error = %e, "failed to encode performance metric"),
            }
            let pair = op_key(&metric.repository, &metric.operation);
            if !touched.contains(&pair) {
                touched.push(pair);
            }
        }

        for (repository, operation) in touched {
            let Some(snapshot) = self.stats(&repository, &operation) else {
                continue;
            };
            let key = format!("{}perf:stats:{repository}:{operation}", self.key_prefix);
            match serde_json::to_string(&snapshot) {
                Ok(raw) => entries.push(KvEntry::new(key, raw, STATS_TTL)),
                Err(e) => warn!(error = %e, "failed to encode performance stats"),
            }
        }
        entries
    }

    fn history_key(&self, repository: &str, operation: &str) -> String {
        format!("{}perf:history:{repository}:{operation}", self.key_prefix)
    }
}

async fn write_batch(store: &dyn KvStore, entries: Vec<KvEntry>) {
    let count = entries.len();
    if let Err(e) = store.set_many_ex(entries).await {
        warn!(count, error = %e, "performance metric flush failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::MemoryStore;

    fn monitor_with(store: Arc<MemoryStore>, settings: MonitorSettings) -> PerformanceMonitor {
        PerformanceMonitor::new(store, settings, "strata:")
    }

    fn monitor() -> (Arc<MemoryStore>, PerformanceMonitor) {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor_with(store.clone(), MonitorSettings::default());
        (store, monitor)
    }

    fn metric(op: &str, duration_ms: f64, status: OperationStatus) -> PerformanceMetric {
        PerformanceMetric {
            repository: "cards".into(),
            operation: op.into(),
            duration_ms,
            status,
            correlation_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            error_message: (status == OperationStatus::Error).then(|| "boom".to_string()),
            query_details: None,
        }
    }

    async fn all_keys(store: &MemoryStore, pattern: &str) -> Vec<String> {
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, page) = store.scan(cursor, pattern, 100).await.unwrap();
            keys.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys
    }

    #[test]
    fn percentiles_over_synthetic_durations() {
        let (_, monitor) = monitor();
        for d in (1..=10).map(|n| (n * 10) as f64) {
            monitor.record(metric("find_by_id", d, OperationStatus::Success));
        }

        let stats = monitor.stats("cards", "find_by_id").unwrap();
        assert_eq!(stats.count, 10);
        assert_eq!((stats.p50, stats.p95, stats.p99), (50.0, 100.0, 100.0));
        assert_eq!(stats.average_duration_ms, 55.0);
    }

    #[tokio::test(start_paused = true)]
    async fn bracket_measures_elapsed_time_and_clears_mark() {
        let (_, monitor) = monitor();
        monitor.start_operation("cards", "create", "c-1");
        tokio::time::advance(Duration::from_millis(250)).await;

        let metric = monitor
            .end_operation("cards", "create", "c-1", OperationStatus::Success, None, None)
            .unwrap();
        assert!((metric.duration_ms - 250.0).abs() < 1.0);

        // Mark is gone: a second end is a no-op
        assert!(monitor
            .end_operation("cards", "create", "c-1", OperationStatus::Success, None, None)
            .is_none());
        assert_eq!(monitor.stats("cards", "create").unwrap().count, 1);
    }

    #[test]
    fn end_without_start_records_nothing() {
        let (_, monitor) = monitor();
        assert!(monitor
            .end_operation("cards", "update", "missing", OperationStatus::Error, None, None)
            .is_none());
        assert!(monitor.stats("cards", "update").is_none());
    }

    #[tokio::test]
    async fn threshold_alerts_one_per_breach() {
        let (_, monitor) = monitor();
        let mut alerts = monitor.subscribe();

        monitor.record(metric("find_many", 999.0, OperationStatus::Success));
        monitor.record(metric("find_many", 1000.0, OperationStatus::Success));
        monitor.record(metric("find_many", 5000.0, OperationStatus::Success));

        let first = alerts.try_recv().unwrap();
        assert_eq!(first.level, AlertLevel::Warning);
        assert_eq!(first.threshold_ms, 1000);

        let second = alerts.try_recv().unwrap();
        assert_eq!(second.level, AlertLevel::Critical);
        assert_eq!(second.threshold_ms, 5000);
        assert_eq!(second.repository, "cards");

        assert!(alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn runtime_thresholds_override_defaults() {
        let (_, monitor) = monitor();
        let mut alerts = monitor.subscribe();
        monitor.set_threshold(
            "cards",
            "find_by_id",
            ThresholdSettings {
                warning_ms: 50,
                critical_ms: 100,
            },
        );

        monitor.record(metric("find_by_id", 75.0, OperationStatus::Success));
        monitor.record(metric("find_many", 75.0, OperationStatus::Success));

        assert_eq!(alerts.try_recv().unwrap().level, AlertLevel::Warning);
        assert!(alerts.try_recv().is_err());
        assert_eq!(monitor.threshold("cards", "find_many"), DEFAULT_THRESHOLDS);
    }

    #[tokio::test]
    async fn measure_passes_through_results_and_records_errors() {
        let (_, monitor) = monitor();

        let ok: Result<u32, String> = monitor.measure("cards", "find_by_id", async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let err: Result<u32, String> = monitor
            .measure("cards", "find_by_id", async { Err("connection reset".to_string()) })
            .await;
        assert_eq!(err, Err("connection reset".to_string()));

        let stats = monitor.stats("cards", "find_by_id").unwrap();
        assert_eq!((stats.count, stats.error_count), (2, 1));

        let errored = monitor.errored_operations(10);
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].error_message.as_deref(), Some("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_measure_clears_its_mark() {
        let (_, monitor) = monitor();

        for _ in 0..100 {
            let timed_out = tokio::time::timeout(
                Duration::from_millis(10),
                monitor.measure("cards", "find_many", std::future::pending::<Result<(), String>>()),
            )
            .await;
            assert!(timed_out.is_err());
        }

        assert!(monitor.marks.lock().unwrap().is_empty());
        let stats = monitor.stats("cards", "find_many").unwrap();
        assert_eq!((stats.count, stats.error_count), (100, 100));
        let errored = monitor.errored_operations(1);
        assert_eq!(errored[0].error_message.as_deref(), Some(CANCELLED));
        assert!(errored[0].duration_ms >= 10.0);
    }

    #[test]
    fn ring_drops_oldest_half_on_overflow() {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor_with(
            store,
            MonitorSettings {
                ring_capacity: 4,
                flush_batch_size: 1000,
                ..MonitorSettings::default()
            },
        );
        for d in 1..=5 {
            monitor.record(metric("find_many", d as f64, OperationStatus::Success));
        }

        let slow = monitor.slow_queries(10);
        let durations: Vec<f64> = slow.iter().map(|m| m.duration_ms).collect();
        assert_eq!(durations, vec![5.0, 4.0, 3.0]);
        assert_eq!(monitor.slow_queries(1)[0].duration_ms, 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_writes_metrics_and_stats_with_ttls() {
        let (store, monitor) = monitor();
        monitor.record(metric("find_by_id", 12.0, OperationStatus::Success));
        monitor.record(metric("create", 40.0, OperationStatus::Success));

        assert_eq!(monitor.flush().await, 2);
        assert_eq!(monitor.flush().await, 0);

        let metrics = all_keys(&store, "strata:perf:metrics:*").await;
        assert_eq!(metrics.len(), 2);
        assert_eq!(store.ttl(&metrics[0]), Some(METRIC_TTL));

        let stats_key = "strata:perf:stats:cards:find_by_id";
        let raw = store.get(stats_key).await.unwrap().unwrap();
        let stats: PerformanceStats = serde_json::from_str(&raw).unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(store.ttl(stats_key), Some(STATS_TTL));
    }

    #[tokio::test]
    async fn full_batch_flushes_in_background() {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor_with(
            store.clone(),
            MonitorSettings {
                flush_batch_size: 2,
                ..MonitorSettings::default()
            },
        );
        monitor.record(metric("find_by_id", 1.0, OperationStatus::Success));
        monitor.record(metric("find_by_id", 2.0, OperationStatus::Success));

        for _ in 0..50 {
            if all_keys(&store, "strata:perf:metrics:*").await.len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(all_keys(&store, "strata:perf:metrics:*").await.len(), 2);
        assert_eq!(monitor.flush().await, 0);
    }

    async fn seed_history(store: &MemoryStore, op: &str, average: f64) {
        let raw = serde_json::to_string(&Checkpoint {
            average_duration_ms: average,
            recorded_at: Utc::now(),
        })
        .unwrap();
        store
            .set_ex(&format!("strata:perf:history:cards:{op}"), raw, HISTORY_TTL)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn regression_flagged_above_twenty_percent() {
        let (store, monitor) = monitor();
        seed_history(&store, "find_by_id", 100.0).await;
        seed_history(&store, "find_many", 100.0).await;

        monitor.record(metric("find_by_id", 125.0, OperationStatus::Success));
        monitor.record(metric("find_many", 110.0, OperationStatus::Success));

        let regressions = monitor.detect_regressions().await;
        assert_eq!(regressions.len(), 1);
        assert_eq!(regressions[0].operation, "find_by_id");
        assert!((regressions[0].increase - 0.25).abs() < 1e-9);

        // Checkpoint moved forward: same averages are no longer a regression
        assert!(monitor.detect_regressions().await.is_empty());
        let raw = store
            .get("strata:perf:history:cards:find_by_id")
            .await
            .unwrap()
            .unwrap();
        let checkpoint: Checkpoint = serde_json::from_str(&raw).unwrap();
        assert_eq!(checkpoint.average_duration_ms, 125.0);
        assert_eq!(
            store.ttl("strata:perf:history:cards:find_by_id"),
            Some(HISTORY_TTL)
        );
    }

    #[tokio::test]
    async fn first_detection_only_checkpoints() {
        let (store, monitor) = monitor();
        monitor.record(metric("delete", 30.0, OperationStatus::Success));

        assert!(monitor.detect_regressions().await.is_empty());
        assert!(store
            .get("strata:perf:history:cards:delete")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_and_clears_marks() {
        let (store, monitor) = monitor();
        let monitor = Arc::new(monitor);
        monitor.start_flush_loop();
        monitor.start_operation("cards", "update", "dangling");
        monitor.record(metric("update", 3.0, OperationStatus::Success));

        monitor.shutdown().await;

        assert_eq!(all_keys(&store, "strata:perf:metrics:*").await.len(), 1);
        assert!(monitor
            .end_operation("cards", "update", "dangling", OperationStatus::Success, None, None)
            .is_none());
    }
}
