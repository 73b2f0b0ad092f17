//! strata-data: the cache-aside data-access layer
//!
//! - [`cache`]: best-effort cache-aside manager with scan-based invalidation
//! - [`pool`]: named session pools with real admission control and health probes
//! - [`query`]: pagination caps, sort-field mapping, plan hints, batching
//! - [`perf`]: operation timing, percentile stats, threshold alerts, regressions
//! - [`repository`]: cached repositories and the card specialization
//! - [`layer`]: the composition root wiring all of the above

pub mod cache;
pub mod error;
pub mod layer;
pub mod perf;
pub mod pool;
pub mod query;
pub mod repository;

pub use cache::{CacheManager, CacheMetrics, CacheOptions, WarmupItem};
pub use error::{DataError, DataResult};
pub use layer::DataLayer;
pub use perf::{Alert, AlertLevel, OperationStatus, PerformanceMetric, PerformanceMonitor, PerformanceStats};
pub use pool::{HealthStatus, PoolHealth, PoolManager, PoolMetrics, PooledSession, ResizeOutcome};
pub use query::{QueryFilters, QueryOptimizer, QueryOptions, QueryPlan};
pub use repository::{CacheTarget, CachedRepository, Change, Entity, EntityStore, RepositoryContext};
