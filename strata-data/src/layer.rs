//! Process-wide composition root
//!
//! Builds every shared component exactly once and hands out `Arc` handles.
//! Nothing in this crate is a global; tests build their own instances.

use std::sync::Arc;
use std::time::Duration;

use strata_core::{KvStore, MemoryStore, StrataConfig};
use tracing::{info, warn};

use crate::cache::CacheManager;
use crate::error::DataResult;
use crate::perf::PerformanceMonitor;
use crate::pool::postgres::PgConnector;
use crate::pool::PoolManager;
use crate::query::QueryOptimizer;
use crate::repository::{CardRepository, PgCardStore, RepositoryContext};

/// How often every pool is resized against its utilization
pub const OPTIMIZE_INTERVAL: Duration = Duration::from_secs(60);

impl RepositoryContext {
    /// Cache, monitor and optimizer over one backend, with configured thresholds applied.
    pub fn from_config(store: Arc<dyn KvStore>, config: &StrataConfig) -> Self {
        let cache = Arc::new(CacheManager::new(Arc::clone(&store), config.cache.clone()));
        let monitor = Arc::new(PerformanceMonitor::new(
            store,
            config.monitor.clone(),
            config.cache.key_prefix.clone(),
        ));
        for (key, threshold) in &config.thresholds {
            match key.split_once('.') {
                Some((repository, operation)) => {
                    monitor.set_threshold(repository, operation, *threshold)
                }
                None => warn!(key = %key, "threshold key is not '<repository>.<operation>', ignored"),
            }
        }

        Self {
            cache,
            monitor,
            optimizer: Arc::new(QueryOptimizer::new()),
        }
    }
}

/// Open the configured cache backend. Without a Redis URL (or without the `redis`
/// feature) the cache is process-local.
pub async fn open_kv_store(config: &StrataConfig) -> DataResult<Arc<dyn KvStore>> {
    match config.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        Some(url) => {
            let store = strata_core::kv::RedisStore::connect(url)
                .await
                .map_err(|e| crate::DataError::store(format!("cache backend unavailable: {e}")))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            warn!("redis_url set but built without the redis feature, using in-process cache");
            Ok(Arc::new(MemoryStore::new()))
        }
        None => {
            info!("no redis_url configured, using in-process cache");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub struct DataLayer {
    config: StrataConfig,
    ctx: RepositoryContext,
    pools: Arc<PoolManager<PgConnector>>,
    cards: CardRepository<PgCardStore>,
}

impl DataLayer {
    /// Build every component, open the configured pools, run migrations and start
    /// background timers.
    pub async fn connect(config: StrataConfig) -> DataResult<Self> {
        config.validate()?;

        let store = open_kv_store(&config).await?;
        let ctx = RepositoryContext::from_config(store, &config);

        let pools = Arc::new(PoolManager::new(PgConnector::from_url(&config.database_url)?));
        for (name, settings) in &config.pools {
            pools.create_pool(name, *settings).await?;
        }

        let card_store = PgCardStore::new(Arc::clone(&pools));
        card_store.migrate().await?;
        let cards = CardRepository::new(card_store, ctx.clone(), config.repository("cards"));

        ctx.cache.start_metrics_reset();
        ctx.monitor.start_flush_loop();
        pools.spawn_optimizer(OPTIMIZE_INTERVAL);

        cards.initialize().await;

        info!(pools = config.pools.len(), "data layer ready");
        Ok(Self {
            config,
            ctx,
            pools,
            cards,
        })
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    pub fn cards(&self) -> &CardRepository<PgCardStore> {
        &self.cards
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.ctx.cache
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.ctx.monitor
    }

    pub fn optimizer(&self) -> &Arc<QueryOptimizer> {
        &self.ctx.optimizer
    }

    pub fn pools(&self) -> &Arc<PoolManager<PgConnector>> {
        &self.pools
    }

    /// Flush metrics, drain pools, then stop cache timers.
    pub async fn shutdown(&self) {
        self.ctx.monitor.shutdown().await;
        self.pools.shutdown().await;
        self.ctx.cache.shutdown();
        info!("data layer stopped");
    }
}
