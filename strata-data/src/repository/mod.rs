//! Cache-aside repositories
//!
//! [`CachedRepository`] routes reads through [`CacheManager::wrap`] under the
//! entity's namespace and sends writes straight to the [`EntityStore`], followed
//! by invalidation of every cache entry the written entity can appear in. Each
//! call is timed by the [`PerformanceMonitor`] under the repository's name.
//!
//! Key layout for a repository named `cards`:
//! - `cards:{id}` single entity (plus parameterized variants)
//! - `cards:list:*` results of `find_one` / `find_many`
//! - anything [`Entity::cache_targets`] declares, e.g. `cards:owner:{user_id}`

pub mod cards;
pub mod pg_cards;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use strata_core::{KeyParams, RepositorySettings};
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, CacheOptions, WarmupItem};
use crate::error::DataResult;
use crate::perf::PerformanceMonitor;
use crate::query::{QueryFilters, QueryOptimizer};

pub use cards::{Card, CardPatch, CardRepository, CardStatus, NewCard};
pub use pg_cards::PgCardStore;

/// A cache entry, or group of entries, a write can make stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheTarget {
    /// `namespace:identifier` and its parameterized variants
    Entry {
        namespace: String,
        identifier: String,
    },
    /// Every key under `namespace:`
    Namespace(String),
}

impl CacheTarget {
    pub fn entry(namespace: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::Entry {
            namespace: namespace.into(),
            identifier: identifier.into(),
        }
    }

    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self::Namespace(namespace.into())
    }
}

pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn id(&self) -> String;

    /// Derived-query entries this entity appears in, beyond its own key and the
    /// list namespace.
    fn cache_targets(&self, _namespace: &str) -> Vec<CacheTarget> {
        Vec::new()
    }
}

/// Before and after images of an updated entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Change<E> {
    pub previous: E,
    pub current: E,
}

/// Datastore access for one entity type. The source of truth behind the cache.
#[async_trait]
pub trait EntityStore: Send + Sync + 'static {
    type Entity: Entity;
    type Draft: Send + 'static;
    type Patch: Send + 'static;

    async fn find_by_id(&self, id: &str) -> DataResult<Option<Self::Entity>>;

    async fn find_one(&self, filters: &QueryFilters) -> DataResult<Option<Self::Entity>>;

    async fn find_many(&self, filters: &QueryFilters) -> DataResult<Vec<Self::Entity>>;

    async fn create(&self, draft: Self::Draft) -> DataResult<Self::Entity>;

    /// Fails with [`DataError::NotFound`](crate::DataError::NotFound) when `id` does not exist.
    async fn update(&self, id: &str, patch: Self::Patch) -> DataResult<Change<Self::Entity>>;

    /// Returns the removed entity, or `None` if nothing matched.
    async fn delete(&self, id: &str) -> DataResult<Option<Self::Entity>>;
}

#[async_trait]
impl<S: EntityStore> EntityStore for Arc<S> {
    type Entity = S::Entity;
    type Draft = S::Draft;
    type Patch = S::Patch;

    async fn find_by_id(&self, id: &str) -> DataResult<Option<Self::Entity>> {
        (**self).find_by_id(id).await
    }

    async fn find_one(&self, filters: &QueryFilters) -> DataResult<Option<Self::Entity>> {
        (**self).find_one(filters).await
    }

    async fn find_many(&self, filters: &QueryFilters) -> DataResult<Vec<Self::Entity>> {
        (**self).find_many(filters).await
    }

    async fn create(&self, draft: Self::Draft) -> DataResult<Self::Entity> {
        (**self).create(draft).await
    }

    async fn update(&self, id: &str, patch: Self::Patch) -> DataResult<Change<Self::Entity>> {
        (**self).update(id, patch).await
    }

    async fn delete(&self, id: &str) -> DataResult<Option<Self::Entity>> {
        (**self).delete(id).await
    }
}

/// Shared components every repository is built from.
#[derive(Clone)]
pub struct RepositoryContext {
    pub cache: Arc<CacheManager>,
    pub monitor: Arc<PerformanceMonitor>,
    pub optimizer: Arc<QueryOptimizer>,
}

pub struct CachedRepository<S: EntityStore> {
    name: String,
    store: S,
    ctx: RepositoryContext,
    settings: RepositorySettings,
}

impl<S: EntityStore> CachedRepository<S> {
    pub fn new(
        name: impl Into<String>,
        store: S,
        ctx: RepositoryContext,
        settings: RepositorySettings,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            ctx,
            settings,
        }
    }

    /// Repository name. Doubles as the cache namespace and the monitored repository.
    pub fn namespace(&self) -> &str {
        &self.name
    }

    pub fn list_namespace(&self) -> String {
        format!("{}:list", self.name)
    }

    pub fn settings(&self) -> &RepositorySettings {
        &self.settings
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.ctx.cache
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.ctx.monitor
    }

    /// Preload the first page of entities when `warmup_on_init` is set.
    /// Returns how many entries were written; warmup failures never fail startup.
    pub async fn initialize(&self) -> usize {
        if !self.settings.warmup_on_init {
            return 0;
        }

        let filters = self.ctx.optimizer.optimize_filters(&QueryFilters::default());
        let entities = match self.store.find_many(&filters).await {
            Ok(entities) => entities,
            Err(e) => {
                warn!(repository = %self.name, error = %e, "warmup query failed");
                return 0;
            }
        };

        let ttl = self.settings.ttl();
        let items = entities
            .into_iter()
            .map(|entity| {
                let mut item = WarmupItem::new(entity.id(), entity);
                item.ttl = Some(ttl);
                item
            })
            .collect();
        let warmed = self.ctx.cache.warmup(&self.name, items).await;
        info!(repository = %self.name, warmed, "repository initialized");
        warmed
    }

    pub async fn find_by_id(&self, id: &str) -> DataResult<Option<S::Entity>> {
        let options = self.options().cache_null(self.settings.cache_null_values);
        self.ctx
            .monitor
            .measure(
                &self.name,
                "find_by_id",
                self.ctx
                    .cache
                    .wrap(&self.name, id, || self.store.find_by_id(id), &options),
            )
            .await
    }

    pub async fn find_one(&self, filters: &QueryFilters) -> DataResult<Option<S::Entity>> {
        let filters = self.prepare(filters);
        let options = self.options().with_params(filter_params(&filters));
        let namespace = self.list_namespace();
        self.ctx
            .monitor
            .measure(
                &self.name,
                "find_one",
                self.ctx
                    .cache
                    .wrap(&namespace, "one", || self.store.find_one(&filters), &options),
            )
            .await
    }

    pub async fn find_many(&self, filters: &QueryFilters) -> DataResult<Vec<S::Entity>> {
        let filters = self.prepare(filters);
        let options = self.options().with_params(filter_params(&filters));
        let namespace = self.list_namespace();
        self.ctx
            .monitor
            .measure(
                &self.name,
                "find_many",
                self.ctx
                    .cache
                    .wrap(&namespace, "many", || self.store.find_many(&filters), &options),
            )
            .await
    }

    pub async fn create(&self, draft: S::Draft) -> DataResult<S::Entity> {
        self.ctx
            .monitor
            .measure(&self.name, "create", async {
                let entity = self.store.create(draft).await?;
                self.after_write([&entity]).await;
                Ok(entity)
            })
            .await
    }

    pub async fn update(&self, id: &str, patch: S::Patch) -> DataResult<S::Entity> {
        self.ctx
            .monitor
            .measure(&self.name, "update", async {
                let change = self.store.update(id, patch).await?;
                self.after_write([&change.previous, &change.current]).await;
                Ok(change.current)
            })
            .await
    }

    /// Returns whether an entity was removed.
    pub async fn delete(&self, id: &str) -> DataResult<bool> {
        self.ctx
            .monitor
            .measure(&self.name, "delete", async {
                match self.store.delete(id).await? {
                    Some(removed) => {
                        self.after_write([&removed]).await;
                        Ok(true)
                    }
                    None => {
                        // A cached "not found" may exist
                        self.ctx.cache.invalidate(&self.name, Some(id)).await;
                        Ok(false)
                    }
                }
            })
            .await
    }

    /// Every cache target a write touching `entity` invalidates.
    pub fn invalidation_targets(&self, entity: &S::Entity) -> Vec<CacheTarget> {
        let mut targets = vec![
            CacheTarget::entry(&self.name, entity.id()),
            CacheTarget::namespace(self.list_namespace()),
        ];
        targets.extend(entity.cache_targets(&self.name));
        targets
    }

    /// Cache-aside read for a derived lookup owned by a specialization.
    pub async fn cached<T, F, Fut>(
        &self,
        operation: &str,
        namespace: &str,
        identifier: &str,
        options: &CacheOptions,
        fetch: F,
    ) -> DataResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = DataResult<T>>,
    {
        self.ctx
            .monitor
            .measure(
                &self.name,
                operation,
                self.ctx.cache.wrap(namespace, identifier, fetch, options),
            )
            .await
    }

    /// Default options for this repository's entries.
    pub fn options(&self) -> CacheOptions {
        CacheOptions::new().with_ttl(self.settings.ttl())
    }

    async fn after_write<'e>(&self, entities: impl IntoIterator<Item = &'e S::Entity>) {
        if !self.settings.invalidate_on_write {
            return;
        }

        let mut targets: Vec<CacheTarget> = entities
            .into_iter()
            .flat_map(|entity| self.invalidation_targets(entity))
            .collect();
        targets.sort();
        targets.dedup();

        let mut removed = 0;
        for target in &targets {
            removed += match target {
                CacheTarget::Entry {
                    namespace,
                    identifier,
                } => self.ctx.cache.invalidate(namespace, Some(identifier)).await,
                CacheTarget::Namespace(namespace) => {
                    self.ctx.cache.invalidate(namespace, None).await
                }
            };
        }
        debug!(repository = %self.name, targets = targets.len(), removed, "write invalidated cache");
    }

    fn prepare(&self, filters: &QueryFilters) -> QueryFilters {
        let filters = self.ctx.optimizer.optimize_filters(filters);
        self.ctx
            .optimizer
            .analyze_query_pattern(&self.name, Some(&filters), None);
        filters
    }
}

fn filter_params(filters: &QueryFilters) -> KeyParams {
    KeyParams::from_serializable(filters).unwrap_or_else(|e| {
        warn!(error = %e, "query filters not representable as key params");
        KeyParams::new()
    })
}
