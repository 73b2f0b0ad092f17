//! Key-value backend contract
//!
//! The cache manager and the performance monitor's durable sink both talk to a
//! shared, namespaced keyspace through [`KvStore`]. Values are serialized JSON text.
//! Deletion by pattern is always done with cursor-based [`KvStore::scan`] pages,
//! never with a blocking full-keyspace listing.

mod glob;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use glob::{escape_glob, glob_matcher};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Backend failure. Callers in this workspace log and absorb these.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("invalid key pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// One write in a pipelined batch.
#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
    pub ttl: Duration,
}

impl KvEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }
}

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Store with expiry. Overwrites any existing value (last writer wins).
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), KvError>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, KvError>;

    /// One page of an incremental scan. A returned cursor of 0 ends the iteration.
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), KvError>;

    /// Write all entries in a single round trip.
    async fn set_many_ex(&self, entries: Vec<KvEntry>) -> Result<(), KvError>;

    async fn ping(&self) -> Result<(), KvError>;
}
