//! strata-core: shared building blocks for the strata data-access layer
//!
//! - [`config`]: TOML configuration for pools, repositories, thresholds and the monitor
//! - [`keys`]: canonical cache-key derivation from typed parameter lists
//! - [`kv`]: the key-value backend contract plus in-process and Redis implementations

pub mod config;
pub mod error;
pub mod keys;
pub mod kv;

pub use config::{
    CacheSettings, MonitorSettings, PoolSettings, RepositorySettings, StrataConfig,
    ThresholdSettings,
};
pub use error::{Result, StrataError};
pub use keys::{KeyParams, ParamValue};
pub use kv::{KvEntry, KvError, KvStore, MemoryStore};
