//! Cache-aside manager over a shared key-value backend
//!
//! Every operation here is best-effort. Backend failures are logged and turned into
//! misses or no-ops; the datastore stays the source of truth.
//!
//! [`CacheManager::wrap`] has no single-flight de-duplication: concurrent callers that
//! miss on the same key each run their fetch and the last `set` wins. Stale windows
//! after a write are bounded by the entry TTL.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use strata_core::keys::cache_key;
use strata_core::kv::escape_glob;
use strata_core::{CacheSettings, KeyParams, KvEntry, KvStore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-call options for `set` and `wrap`.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    pub ttl: Option<Duration>,
    pub params: Option<KeyParams>,
    /// Store `null` results instead of skipping them
    pub cache_null: bool,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_params(mut self, params: KeyParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn cache_null(mut self, cache_null: bool) -> Self {
        self.cache_null = cache_null;
        self
    }
}

/// One entry for [`CacheManager::warmup`].
#[derive(Debug, Clone)]
pub struct WarmupItem<T> {
    pub identifier: String,
    pub value: T,
    pub params: Option<KeyParams>,
    pub ttl: Option<Duration>,
}

impl<T> WarmupItem<T> {
    pub fn new(identifier: impl Into<String>, value: T) -> Self {
        Self {
            identifier: identifier.into(),
            value,
            params: None,
            ttl: None,
        }
    }
}

/// Hit/miss snapshot for one namespace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub namespace: String,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub last_reset: DateTime<Utc>,
}

struct NamespaceCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    last_reset: Mutex<DateTime<Utc>>,
}

impl NamespaceCounters {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            last_reset: Mutex::new(Utc::now()),
        }
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        if let Ok(mut last) = self.last_reset.lock() {
            *last = Utc::now();
        }
    }

    fn snapshot(&self, namespace: &str) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheMetrics {
            namespace: namespace.to_string(),
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            last_reset: self
                .last_reset
                .lock()
                .map(|t| *t)
                .unwrap_or_else(|_| Utc::now()),
        }
    }
}

pub struct CacheManager {
    store: Arc<dyn KvStore>,
    settings: CacheSettings,
    metrics: RwLock<HashMap<String, Arc<NamespaceCounters>>>,
    reset_task: Mutex<Option<JoinHandle<()>>>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn KvStore>, settings: CacheSettings) -> Self {
        Self {
            store,
            settings,
            metrics: RwLock::new(HashMap::new()),
            reset_task: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Full backend key for `(namespace, identifier, params)`.
    pub fn key(&self, namespace: &str, identifier: &str, params: Option<&KeyParams>) -> String {
        cache_key(&self.settings.key_prefix, namespace, identifier, params)
    }

    /// Fetch and deserialize a cached value. Backend and decode failures count as misses.
    pub async fn get<T: DeserializeOwned>(
        &self,
        namespace: &str,
        identifier: &str,
        params: Option<&KeyParams>,
    ) -> Option<T> {
        let key = self.key(namespace, identifier, params);
        let raw = match self.store.get(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "cache get failed, treating as miss");
                None
            }
        };

        let value = raw.and_then(|raw| match serde_json::from_str::<T>(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "cache entry failed to decode, treating as miss");
                None
            }
        });

        let counters = self.counters(namespace);
        if value.is_some() {
            counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "cache hit");
        } else {
            counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "cache miss");
        }
        value
    }

    /// Serialize and store a value. Returns whether the write reached the backend.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        namespace: &str,
        identifier: &str,
        value: &T,
        options: &CacheOptions,
    ) -> bool {
        let key = self.key(namespace, identifier, options.params.as_ref());
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "cache value failed to serialize, skipping set");
                return false;
            }
        };
        let ttl = options.ttl.unwrap_or_else(|| self.settings.default_ttl());

        match self.store.set_ex(&key, raw, ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %key, error = %e, "cache set failed");
                false
            }
        }
    }

    /// Cache-aside read: return the cached value, or run `fetch`, store its result and
    /// return it. `null` results are only stored when `options.cache_null` is set.
    ///
    /// Errors from `fetch` propagate untouched and nothing is cached for them.
    pub async fn wrap<T, E, F, Fut>(
        &self,
        namespace: &str,
        identifier: &str,
        fetch: F,
        options: &CacheOptions,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self
            .get::<T>(namespace, identifier, options.params.as_ref())
            .await
        {
            return Ok(cached);
        }

        let value = fetch().await?;

        let is_null = serde_json::to_value(&value)
            .map(|v| v.is_null())
            .unwrap_or(false);
        if !is_null || options.cache_null {
            self.set(namespace, identifier, &value, options).await;
        }

        Ok(value)
    }

    /// Drop one identifier (and all its parameterized variants) or, without an
    /// identifier, the whole namespace. Returns the number of keys removed.
    pub async fn invalidate(&self, namespace: &str, identifier: Option<&str>) -> u64 {
        let removed = match identifier {
            Some(identifier) => {
                let key = self.key(namespace, identifier, None);
                let exact = match self.store.del(std::slice::from_ref(&key)).await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(key = %key, error = %e, "cache delete failed");
                        0
                    }
                };
                exact + self.delete_matching(&format!("{}:*", escape_glob(&key))).await
            }
            None => {
                let base = format!("{}{}", self.settings.key_prefix, namespace);
                self.delete_matching(&format!("{}:*", escape_glob(&base)))
                    .await
            }
        };

        debug!(namespace, identifier = ?identifier, removed, "cache invalidated");
        removed
    }

    /// Delete every key matching a glob relative to the key prefix.
    pub async fn invalidate_pattern(&self, pattern: &str) -> u64 {
        let full = format!("{}{}", escape_glob(&self.settings.key_prefix), pattern);
        let removed = self.delete_matching(&full).await;
        debug!(pattern = %full, removed, "cache pattern invalidated");
        removed
    }

    /// Preload entries with one pipelined write. Returns how many were written.
    pub async fn warmup<T: Serialize>(&self, namespace: &str, items: Vec<WarmupItem<T>>) -> usize {
        let default_ttl = self.settings.default_ttl();
        let entries: Vec<KvEntry> = items
            .into_iter()
            .filter_map(|item| {
                let key = self.key(namespace, &item.identifier, item.params.as_ref());
                match serde_json::to_string(&item.value) {
                    Ok(raw) => Some(KvEntry::new(key, raw, item.ttl.unwrap_or(default_ttl))),
                    Err(e) => {
                        warn!(key = %key, error = %e, "warmup value failed to serialize");
                        None
                    }
                }
            })
            .collect();

        let count = entries.len();
        if count == 0 {
            return 0;
        }
        match self.store.set_many_ex(entries).await {
            Ok(()) => {
                info!(namespace, count, "cache warmed");
                count
            }
            Err(e) => {
                warn!(namespace, error = %e, "cache warmup failed");
                0
            }
        }
    }

    /// Hit/miss metrics for one namespace, or all namespaces sorted by name.
    pub fn metrics(&self, namespace: Option<&str>) -> Vec<CacheMetrics> {
        let Ok(map) = self.metrics.read() else {
            return Vec::new();
        };
        let mut out: Vec<CacheMetrics> = match namespace {
            Some(ns) => map.get(ns).map(|c| c.snapshot(ns)).into_iter().collect(),
            None => map.iter().map(|(ns, c)| c.snapshot(ns)).collect(),
        };
        out.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        out
    }

    pub fn reset_metrics(&self) {
        if let Ok(map) = self.metrics.read() {
            for counters in map.values() {
                counters.reset();
            }
        }
    }

    /// Reset hit/miss counters on the configured wall-clock interval.
    pub fn start_metrics_reset(self: &Arc<Self>) {
        let period = self.settings.metrics_reset_interval();
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.reset_metrics();
                debug!("cache metrics reset");
            }
        });

        if let Ok(mut slot) = self.reset_task.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.reset_task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    fn counters(&self, namespace: &str) -> Arc<NamespaceCounters> {
        if let Ok(map) = self.metrics.read() {
            if let Some(counters) = map.get(namespace) {
                return Arc::clone(counters);
            }
        }
        match self.metrics.write() {
            Ok(mut map) => Arc::clone(
                map.entry(namespace.to_string())
                    .or_insert_with(|| Arc::new(NamespaceCounters::new())),
            ),
            // Poisoned map: count into a detached set rather than fail the read
            Err(_) => Arc::new(NamespaceCounters::new()),
        }
    }

    /// Incremental SCAN + DEL, one page at a time.
    async fn delete_matching(&self, pattern: &str) -> u64 {
        let mut cursor = 0u64;
        let mut removed = 0u64;
        loop {
            let (next, keys) = match self
                .store
                .scan(cursor, pattern, self.settings.scan_batch_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(pattern, error = %e, "cache scan failed, invalidation incomplete");
                    break;
                }
            };

            if !keys.is_empty() {
                match self.store.del(&keys).await {
                    Ok(n) => removed += n,
                    Err(e) => warn!(pattern, error = %e, "cache delete failed"),
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }
        removed
    }
}
