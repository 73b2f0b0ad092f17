//! Named, bounded pools of datastore sessions
//!
//! Each pool is a concurrency limiter with real sessions: a slot holds one
//! independently opened session, and checking it out moves the session to the caller
//! until the [`PooledSession`] guard is dropped. Gauges always satisfy
//! `idle = total - active`.

mod health;
mod metrics;
pub mod postgres;
mod session;

use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use strata_core::PoolSettings;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DataError, DataResult};

pub use health::{HealthStatus, PoolHealth};
pub use metrics::PoolMetrics;
pub use session::{Connector, Session};

use metrics::PoolCounters;

/// Bounded wait for active sessions to come home during shutdown.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Utilization above which a pool grows.
const GROW_ABOVE: f64 = 0.8;
/// Utilization below which a pool shrinks.
const SHRINK_BELOW: f64 = 0.2;
const GROW_STEP: usize = 2;

pub type SessionId = u64;

/// Result of one `optimize_pool` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    Grew { from: usize, to: usize },
    Shrank { from: usize, to: usize },
    Unchanged,
}

struct Slot<S> {
    id: SessionId,
    /// `None` while checked out
    session: Option<S>,
    idle_since: Instant,
}

struct PoolState<S> {
    slots: Vec<Slot<S>>,
    active: HashSet<SessionId>,
}

struct Pool<C: Connector> {
    name: String,
    settings: PoolSettings,
    connector: Arc<C>,
    next_id: Arc<AtomicU64>,
    state: Mutex<PoolState<C::Session>>,
    health: Mutex<PoolHealth>,
    counters: PoolCounters,
    created_at: Instant,
}

/// A checked-out session. Dropping it returns the session to its pool.
pub struct PooledSession<C: Connector> {
    id: SessionId,
    session: Option<C::Session>,
    pool: Arc<Pool<C>>,
}

impl<C: Connector> PooledSession<C> {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }
}

impl<C: Connector> Deref for PooledSession<C> {
    type Target = C::Session;

    fn deref(&self) -> &Self::Target {
        // Only `Drop` takes the session out.
        self.session.as_ref().expect("session present until drop")
    }
}

impl<C: Connector> DerefMut for PooledSession<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut().expect("session present until drop")
    }
}

impl<C: Connector> Drop for PooledSession<C> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.check_in(self.id, session);
        }
    }
}

impl<C: Connector> Pool<C> {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState<C::Session>> {
        // A panic while holding this lock leaves plain bookkeeping behind; keep serving.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Atomically claim a free slot, if any.
    fn try_checkout(self: &Arc<Self>) -> Option<PooledSession<C>> {
        let mut state = self.lock_state();
        let PoolState { slots, active } = &mut *state;
        let slot = slots
            .iter_mut()
            .find(|slot| slot.session.is_some() && !active.contains(&slot.id))?;
        let session = slot.session.take()?;
        active.insert(slot.id);

        Some(PooledSession {
            id: slot.id,
            session: Some(session),
            pool: Arc::clone(self),
        })
    }

    /// Return a session to its slot. Releasing an id that is not active is a no-op
    /// apart from restoring the session.
    fn check_in(&self, id: SessionId, session: C::Session) {
        let mut state = self.lock_state();
        let was_active = state.active.remove(&id);
        match state.slots.iter_mut().find(|slot| slot.id == id) {
            Some(slot) => {
                slot.session = Some(session);
                slot.idle_since = Instant::now();
            }
            None => debug!(pool = %self.name, session = id, "session returned to discarded slot"),
        }
        if !was_active {
            debug!(pool = %self.name, session = id, "release of inactive session ignored");
        }
    }

    /// `(active, total)` read under one lock.
    fn gauges(&self) -> (usize, usize) {
        let state = self.lock_state();
        (state.active.len(), state.slots.len())
    }

    fn metrics(&self) -> PoolMetrics {
        let (active, total) = self.gauges();
        self.counters
            .snapshot(active, total, self.created_at.elapsed())
    }

    async fn open_session(&self) -> DataResult<C::Session> {
        match tokio::time::timeout(self.settings.connection_timeout(), self.connector.connect()).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(DataError::Connect {
                pool: self.name.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(DataError::Connect {
                pool: self.name.clone(),
                reason: format!(
                    "timed out after {}ms",
                    self.settings.connection_timeout_ms
                ),
            }),
        }
    }

    /// Open up to `count` sessions without exceeding `max_connections`.
    async fn grow(&self, count: usize) -> usize {
        let max = self.settings.max_connections as usize;
        let mut added = 0;
        for _ in 0..count {
            let session = match self.open_session().await {
                Ok(session) => session,
                Err(e) => {
                    self.counters.connection_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(pool = %self.name, error = %e, "failed to open session");
                    break;
                }
            };

            let mut state = self.lock_state();
            if state.slots.len() >= max {
                break;
            }
            state.slots.push(Slot {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                session: Some(session),
                idle_since: Instant::now(),
            });
            added += 1;
        }
        added
    }

    /// Drop the longest-idle session that has sat idle for at least `idle_timeout`.
    fn shrink_one(&self) -> bool {
        let idle_timeout = self.settings.idle_timeout();
        let now = Instant::now();
        let mut state = self.lock_state();
        if state.slots.len() <= self.settings.min_connections as usize {
            return false;
        }

        let PoolState { slots, active } = &mut *state;
        let candidate = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.session.is_some() && !active.contains(&slot.id))
            .filter(|(_, slot)| now.duration_since(slot.idle_since) >= idle_timeout)
            .min_by_key(|(_, slot)| slot.idle_since)
            .map(|(index, _)| index);

        match candidate {
            Some(index) => {
                slots.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Probe one idle session. Returns `None` when every session is busy.
    async fn check_health(self: &Arc<Self>) -> Option<PoolHealth> {
        let Some(mut session) = self.try_checkout() else {
            debug!(pool = %self.name, "all sessions busy, skipping health probe");
            return None;
        };

        let started = Instant::now();
        let probe = tokio::time::timeout(self.settings.connection_timeout(), session.probe()).await;
        let latency = started.elapsed();
        drop(session);

        let mut health = self.health.lock().unwrap_or_else(|p| p.into_inner());
        match probe {
            Ok(Ok(())) => health.record_success(latency),
            Ok(Err(e)) => {
                health.record_failure();
                warn!(pool = %self.name, error = %e, failures = health.consecutive_failures, "health probe failed");
            }
            Err(_) => {
                health.record_failure();
                warn!(pool = %self.name, failures = health.consecutive_failures, "health probe timed out");
            }
        }
        Some(health.clone())
    }

    fn health(&self) -> PoolHealth {
        self.health
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }
}

/// Owns every named pool and their background health checks.
pub struct PoolManager<C: Connector> {
    connector: Arc<C>,
    pools: RwLock<HashMap<String, Arc<Pool<C>>>>,
    next_id: Arc<AtomicU64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    drain_timeout: Duration,
}

impl<C: Connector> PoolManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector: Arc::new(connector),
            pools: RwLock::new(HashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            tasks: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Create a pool, open its minimum sessions and start its health checks.
    pub async fn create_pool(&self, name: &str, settings: PoolSettings) -> DataResult<()> {
        if settings.max_connections == 0 || settings.min_connections > settings.max_connections {
            return Err(DataError::Config(strata_core::StrataError::config(format!(
                "pool '{name}': invalid connection bounds {}..={}",
                settings.min_connections, settings.max_connections
            ))));
        }

        let pool = Arc::new(Pool {
            name: name.to_string(),
            settings,
            connector: Arc::clone(&self.connector),
            next_id: Arc::clone(&self.next_id),
            state: Mutex::new(PoolState {
                slots: Vec::new(),
                active: HashSet::new(),
            }),
            health: Mutex::new(PoolHealth::default()),
            counters: PoolCounters::default(),
            created_at: Instant::now(),
        });

        let initial = settings.min_connections.max(1) as usize;
        let opened = pool.grow(initial).await;
        if opened == 0 {
            return Err(DataError::Connect {
                pool: name.to_string(),
                reason: "no session could be opened".to_string(),
            });
        }

        self.spawn_health_check(&pool);
        self.write_pools().insert(name.to_string(), pool);
        info!(pool = name, sessions = opened, max = settings.max_connections, "pool created");
        Ok(())
    }

    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_pools().keys().cloned().collect();
        names.sort();
        names
    }

    /// Claim a free session, retrying with a fixed delay up to `max_retries` times.
    pub async fn get_connection(&self, pool_name: &str) -> DataResult<PooledSession<C>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(DataError::ShuttingDown);
        }
        let pool = self.pool(pool_name)?;
        let max_retries = pool.settings.max_retries;
        let started = Instant::now();

        for attempt in 0..=max_retries {
            if let Some(session) = pool.try_checkout() {
                pool.counters.record_wait(started.elapsed());
                return Ok(session);
            }
            if attempt == max_retries {
                break;
            }
            if attempt == 0 {
                pool.counters.waiting_requests.fetch_add(1, Ordering::Relaxed);
            }
            debug!(pool = pool_name, attempt = attempt + 1, "no free session, backing off");
            tokio::time::sleep(pool.settings.retry_delay()).await;
        }

        pool.counters.connection_errors.fetch_add(1, Ordering::Relaxed);
        warn!(pool = pool_name, attempts = max_retries + 1, "pool exhausted");
        Err(DataError::PoolExhausted {
            pool: pool_name.to_string(),
            attempts: max_retries + 1,
        })
    }

    /// Return a session early. Dropping the guard does the same.
    pub fn release_connection(&self, session: PooledSession<C>) {
        drop(session);
    }

    /// Acquire, run `operation`, and release on every exit path.
    pub async fn execute_with_connection<T, F>(&self, pool_name: &str, operation: F) -> DataResult<T>
    where
        F: for<'c> FnOnce(&'c mut C::Session) -> BoxFuture<'c, DataResult<T>>,
    {
        let mut session = self.get_connection(pool_name).await?;
        let pool = Arc::clone(&session.pool);

        let started = Instant::now();
        let result = operation(&mut *session).await;
        pool.counters.record_response(started.elapsed(), result.is_ok());
        drop(session);

        if let Err(e) = &result {
            debug!(pool = pool_name, error = %e, "pooled operation failed");
        }
        result
    }

    /// Run one health probe now.
    pub async fn check_health(&self, pool_name: &str) -> DataResult<Option<PoolHealth>> {
        let pool = self.pool(pool_name)?;
        Ok(pool.check_health().await)
    }

    pub fn health(&self, pool_name: &str) -> DataResult<(PoolHealth, HealthStatus)> {
        let health = self.pool(pool_name)?.health();
        let status = health.status();
        Ok((health, status))
    }

    /// Health of every pool, sorted by name, for readiness checks.
    pub fn health_report(&self) -> Vec<(String, PoolHealth, HealthStatus)> {
        let mut report: Vec<_> = self
            .read_pools()
            .iter()
            .map(|(name, pool)| {
                let health = pool.health();
                let status = health.status();
                (name.clone(), health, status)
            })
            .collect();
        report.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }

    pub fn metrics(&self, pool_name: &str) -> DataResult<PoolMetrics> {
        Ok(self.pool(pool_name)?.metrics())
    }

    /// Grow by 2 above 80% utilization, shrink by 1 below 20%, within `min..=max`.
    ///
    /// A shrink only closes a session that is idle and has stayed idle for at least
    /// the pool's `idle_timeout`. Until some session qualifies, an under-used pool
    /// reports [`ResizeOutcome::Unchanged`].
    pub async fn optimize_pool(&self, pool_name: &str) -> DataResult<ResizeOutcome> {
        let pool = self.pool(pool_name)?;
        let (active, total) = pool.gauges();
        let max = pool.settings.max_connections as usize;
        let min = pool.settings.min_connections as usize;
        let utilization = if total == 0 {
            1.0
        } else {
            active as f64 / total as f64
        };

        let outcome = if utilization > GROW_ABOVE && total < max {
            let added = pool.grow(GROW_STEP.min(max - total)).await;
            if added == 0 {
                ResizeOutcome::Unchanged
            } else {
                ResizeOutcome::Grew {
                    from: total,
                    to: total + added,
                }
            }
        } else if utilization < SHRINK_BELOW && total > min && pool.shrink_one() {
            ResizeOutcome::Shrank {
                from: total,
                to: total - 1,
            }
        } else {
            ResizeOutcome::Unchanged
        };

        if outcome != ResizeOutcome::Unchanged {
            info!(pool = pool_name, ?outcome, utilization, "pool resized");
        }
        Ok(outcome)
    }

    /// Run `optimize_pool` over every pool on a fixed interval.
    pub fn spawn_optimizer(self: &Arc<Self>, interval: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                for name in manager.pool_names() {
                    if let Err(e) = manager.optimize_pool(&name).await {
                        debug!(pool = %name, error = %e, "optimizer pass skipped");
                    }
                }
            }
        });
        self.push_task(handle);
    }

    /// Stop background work, wait (bounded) for sessions to drain, then drop all pools.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        let deadline = Instant::now() + self.drain_timeout;
        loop {
            let busy: usize = self
                .read_pools()
                .values()
                .map(|pool| pool.gauges().0)
                .sum();
            if busy == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(busy, "shutdown drain timed out, discarding pools with active sessions");
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        self.write_pools().clear();
        info!("pool manager shut down");
    }

    fn spawn_health_check(&self, pool: &Arc<Pool<C>>) {
        let interval = pool.settings.health_check_interval();
        let weak = Arc::downgrade(pool);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                pool.check_health().await;
            }
        });
        self.push_task(handle);
    }

    fn push_task(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(_) => handle.abort(),
        }
    }

    fn pool(&self, name: &str) -> DataResult<Arc<Pool<C>>> {
        self.read_pools()
            .get(name)
            .cloned()
            .ok_or_else(|| DataError::UnknownPool(name.to_string()))
    }

    fn read_pools(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Pool<C>>>> {
        self.pools.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_pools(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Pool<C>>>> {
        self.pools.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockConnector {
        opened: AtomicUsize,
        failing: Arc<AtomicBool>,
    }

    struct MockSession {
        failing: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Session for MockSession {
        async fn probe(&mut self) -> DataResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(DataError::store("probe refused"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Session = MockSession;

        async fn connect(&self) -> DataResult<MockSession> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(MockSession {
                failing: Arc::clone(&self.failing),
            })
        }
    }

    fn settings(min: u32, max: u32) -> PoolSettings {
        PoolSettings {
            max_connections: max,
            min_connections: min,
            max_retries: 3,
            retry_delay_ms: 100,
            idle_timeout_ms: 1_000,
            health_check_interval_ms: 60_000,
            ..PoolSettings::default()
        }
    }

    async fn manager_with(min: u32, max: u32) -> PoolManager<MockConnector> {
        let manager = PoolManager::new(MockConnector::default());
        manager.create_pool("read", settings(min, max)).await.unwrap();
        manager
    }

    /// Check out every free session.
    async fn hold_all(manager: &PoolManager<MockConnector>) -> Vec<PooledSession<MockConnector>> {
        let free = manager.metrics("read").unwrap().idle_connections;
        let mut held = Vec::new();
        for _ in 0..free {
            held.push(manager.get_connection("read").await.unwrap());
        }
        held
    }

    fn assert_gauges(manager: &PoolManager<MockConnector>) {
        let m = manager.metrics("read").unwrap();
        assert!(m.active_connections <= m.total_connections);
        assert_eq!(m.idle_connections, m.total_connections - m.active_connections);
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_are_distinct_and_released_on_drop() {
        let manager = manager_with(2, 2).await;

        let a = manager.get_connection("read").await.unwrap();
        let b = manager.get_connection("read").await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.metrics("read").unwrap().active_connections, 2);
        assert_gauges(&manager);

        manager.release_connection(a);
        assert_eq!(manager.metrics("read").unwrap().active_connections, 1);
        drop(b);
        assert_eq!(manager.metrics("read").unwrap().idle_connections, 2);
        assert_gauges(&manager);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_retries_then_fails() {
        let manager = manager_with(2, 2).await;
        let _a = manager.get_connection("read").await.unwrap();
        let _b = manager.get_connection("read").await.unwrap();

        let started = Instant::now();
        let err = manager.get_connection("read").await.err().unwrap();
        assert!(matches!(
            err,
            DataError::PoolExhausted { ref pool, attempts: 4 } if pool == "read"
        ));
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_millis(400));

        let m = manager.metrics("read").unwrap();
        assert_eq!(m.waiting_requests, 1);
        assert_eq!(m.connection_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_acquisition_succeeds_after_release() {
        let manager = Arc::new(manager_with(1, 1).await);
        let held = manager.get_connection("read").await.unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_connection("read").await.map(|s| s.id()) })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        let held_id = held.id();
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), held_id);
        assert_gauges(&manager);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_releases_on_error_and_counts_it() {
        let manager = manager_with(1, 1).await;

        let ok = manager
            .execute_with_connection("read", |_session| Box::pin(async { Ok(5) }))
            .await
            .unwrap();
        assert_eq!(ok, 5);

        let err = manager
            .execute_with_connection::<i32, _>("read", |_session| {
                Box::pin(async { Err(DataError::store("syntax error")) })
            })
            .await;
        assert!(err.is_err());

        let m = manager.metrics("read").unwrap();
        assert_eq!(m.active_connections, 0);
        assert_eq!(m.requests_served, 2);
        assert_eq!(m.connection_errors, 1);
        assert!(manager.get_connection("read").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_pool_is_an_error() {
        let manager = manager_with(1, 1).await;
        assert!(matches!(
            manager.get_connection("write").await.err(),
            Some(DataError::UnknownPool(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn optimize_grows_under_load_within_max() {
        let manager = manager_with(1, 4).await;
        let _a = manager.get_connection("read").await.unwrap();

        assert_eq!(
            manager.optimize_pool("read").await.unwrap(),
            ResizeOutcome::Grew { from: 1, to: 3 }
        );

        let _b = manager.get_connection("read").await.unwrap();
        let _c = manager.get_connection("read").await.unwrap();
        assert_eq!(
            manager.optimize_pool("read").await.unwrap(),
            ResizeOutcome::Grew { from: 3, to: 4 }
        );

        let _d = manager.get_connection("read").await.unwrap();
        assert_eq!(
            manager.optimize_pool("read").await.unwrap(),
            ResizeOutcome::Unchanged
        );
        assert_eq!(manager.metrics("read").unwrap().total_connections, 4);
        assert_gauges(&manager);
    }

    #[tokio::test(start_paused = true)]
    async fn optimize_shrinks_only_long_idle_sessions_down_to_min() {
        let manager = manager_with(2, 8).await;
        for _ in 0..2 {
            let _all = hold_all(&manager).await;
            manager.optimize_pool("read").await.unwrap();
        }
        assert_eq!(manager.metrics("read").unwrap().total_connections, 6);

        // Fresh sessions are kept until they have idled past idle_timeout.
        assert_eq!(
            manager.optimize_pool("read").await.unwrap(),
            ResizeOutcome::Unchanged
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        let mut shrinks = 0;
        while let ResizeOutcome::Shrank { .. } = manager.optimize_pool("read").await.unwrap() {
            shrinks += 1;
        }
        assert_eq!(shrinks, 4);
        assert_eq!(manager.metrics("read").unwrap().total_connections, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shrink_never_removes_active_sessions() {
        let manager = manager_with(1, 6).await;
        for _ in 0..3 {
            let _all = hold_all(&manager).await;
            manager.optimize_pool("read").await.unwrap();
        }
        assert_eq!(manager.metrics("read").unwrap().total_connections, 6);

        let held = manager.get_connection("read").await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        while let ResizeOutcome::Shrank { .. } = manager.optimize_pool("read").await.unwrap() {}

        // 1 active of 5 total is exactly 20%, which stops the shrink.
        let m = manager.metrics("read").unwrap();
        assert_eq!(m.active_connections, 1);
        assert_eq!(m.total_connections, 5);
        assert_gauges(&manager);

        let second = manager.get_connection("read").await.unwrap();
        assert_ne!(second.id(), held.id());
    }

    #[tokio::test(start_paused = true)]
    async fn health_checks_classify_failure_streaks() {
        let manager = manager_with(1, 1).await;
        manager.connector.failing.store(true, Ordering::SeqCst);

        for expected in [HealthStatus::Degraded, HealthStatus::Degraded, HealthStatus::Unhealthy] {
            manager.check_health("read").await.unwrap();
            assert_eq!(manager.health("read").unwrap().1, expected);
        }

        manager.connector.failing.store(false, Ordering::SeqCst);
        let health = manager.check_health("read").await.unwrap().unwrap();
        assert!(health.is_healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(manager.health_report()[0].2, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn health_probe_skips_busy_pool() {
        let manager = manager_with(1, 1).await;
        let _held = manager.get_connection("read").await.unwrap();
        assert_eq!(manager.check_health("read").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_drain_then_rejects() {
        let manager = Arc::new(manager_with(1, 1).await);
        let held = manager.get_connection("read").await.unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(held);
        });

        let started = Instant::now();
        manager.shutdown().await;
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < DEFAULT_DRAIN_TIMEOUT);
        releaser.await.unwrap();

        assert!(manager.pool_names().is_empty());
        assert!(matches!(
            manager.get_connection("read").await.err(),
            Some(DataError::ShuttingDown)
        ));
    }
}
