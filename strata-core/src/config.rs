use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, StrataError};

/// Connection budget shared by the default pool carve-outs.
const DEFAULT_TOTAL_CONNECTIONS: u32 = 20;

/// Centralized configuration for the data layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub database_url: String,
    pub redis_url: Option<String>,
    /// Upper bound on the sum of every pool's `max_connections`
    pub max_total_connections: Option<u32>,
    pub cache: CacheSettings,
    pub monitor: MonitorSettings,
    pub pools: BTreeMap<String, PoolSettings>,
    pub repositories: BTreeMap<String, RepositorySettings>,
    /// Keyed by `"<repository>.<operation>"`
    pub thresholds: BTreeMap<String, ThresholdSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub key_prefix: String,
    pub default_ttl_secs: u64,
    pub metrics_reset_interval_secs: u64,
    pub scan_batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub health_check_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositorySettings {
    pub ttl_secs: u64,
    pub invalidate_on_write: bool,
    pub warmup_on_init: bool,
    pub cache_null_values: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdSettings {
    pub warning_ms: u64,
    pub critical_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub ring_capacity: usize,
    pub flush_interval_secs: u64,
    pub flush_batch_size: usize,
    pub percentile_window: usize,
    /// Fractional increase over the checkpointed average that counts as a regression
    pub regression_threshold: f64,
}

impl Default for StrataConfig {
    fn default() -> Self {
        let mut repositories = BTreeMap::new();
        repositories.insert("cards".to_string(), RepositorySettings::default());

        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/strata".to_string()),
            redis_url: env::var("REDIS_URL").ok(),
            max_total_connections: Some(DEFAULT_TOTAL_CONNECTIONS),
            cache: CacheSettings::default(),
            monitor: MonitorSettings::default(),
            pools: PoolSettings::carve(DEFAULT_TOTAL_CONNECTIONS),
            repositories,
            thresholds: BTreeMap::new(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            key_prefix: "strata:".to_string(),
            default_ttl_secs: 300,
            metrics_reset_interval_secs: 3600,
            scan_batch_size: 100,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            connection_timeout_ms: 5_000,
            idle_timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 100,
            health_check_interval_ms: 30_000,
        }
    }
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            invalidate_on_write: true,
            warmup_on_init: false,
            cache_null_values: false,
        }
    }
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        Self {
            warning_ms: 1_000,
            critical_ms: 5_000,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            ring_capacity: 10_000,
            flush_interval_secs: 60,
            flush_batch_size: 100,
            percentile_window: 1_000,
            regression_threshold: 0.2,
        }
    }
}

impl CacheSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn metrics_reset_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_reset_interval_secs)
    }
}

impl PoolSettings {
    /// Split one connection budget into the standard `general` / `read` / `write` /
    /// `transaction` pools (40% / 30% / 20% / 10%, at least one connection each).
    pub fn carve(budget: u32) -> BTreeMap<String, PoolSettings> {
        let shares = [
            ("general", 40),
            ("read", 30),
            ("write", 20),
            ("transaction", 10),
        ];

        shares
            .iter()
            .map(|(name, pct)| {
                let max = (budget * pct / 100).max(1);
                let settings = PoolSettings {
                    max_connections: max,
                    min_connections: (max / 4).max(1),
                    ..PoolSettings::default()
                };
                (name.to_string(), settings)
            })
            .collect()
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl RepositorySettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl MonitorSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

impl StrataConfig {
    /// Load config from `$STRATA_CONFIG` or ~/.strata/config.toml
    ///
    /// Fails hard with an actionable error if the file doesn't exist.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Err(StrataError::config(format!(
                "Config not found at {:?}\n\nRun: strata config init",
                path
            )));
        }
        Self::load_from(&path)
    }

    /// Load from an explicit path, then apply environment overrides and validate.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content).map_err(|source| StrataError::Toml {
            path: path.to_path_buf(),
            source,
        })?;

        config.apply_env_overrides();
        config.validate()?;
        debug!(path = %path.display(), pools = config.pools.len(), "config loaded");
        Ok(config)
    }

    /// Config file path: `$STRATA_CONFIG`, else ~/.strata/config.toml
    pub fn config_path() -> PathBuf {
        if let Ok(path) = env::var("STRATA_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".strata/config.toml")
    }

    /// `DATABASE_URL` and `REDIS_URL` win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(url) = env::var("REDIS_URL") {
            self.redis_url = Some(url);
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| StrataError::config(e.to_string()))
    }

    /// Repository settings, falling back to defaults for unlisted repositories.
    pub fn repository(&self, name: &str) -> RepositorySettings {
        self.repositories.get(name).copied().unwrap_or_default()
    }

    /// Configured threshold for `repository.operation`, if any.
    pub fn threshold(&self, repository: &str, operation: &str) -> Option<ThresholdSettings> {
        self.thresholds
            .get(&format!("{repository}.{operation}"))
            .copied()
    }

    pub fn validate(&self) -> Result<()> {
        if self.pools.is_empty() {
            return Err(StrataError::config("at least one pool must be configured"));
        }

        for (name, pool) in &self.pools {
            if pool.max_connections == 0 {
                return Err(StrataError::config(format!(
                    "pool '{name}': max_connections must be greater than 0"
                )));
            }
            if pool.min_connections > pool.max_connections {
                return Err(StrataError::config(format!(
                    "pool '{name}': min_connections ({}) exceeds max_connections ({})",
                    pool.min_connections, pool.max_connections
                )));
            }
            if pool.health_check_interval_ms == 0 {
                return Err(StrataError::config(format!(
                    "pool '{name}': health_check_interval_ms must be greater than 0"
                )));
            }
        }

        if let Some(budget) = self.max_total_connections {
            let carved: u32 = self.pools.values().map(|p| p.max_connections).sum();
            if carved > budget {
                return Err(StrataError::config(format!(
                    "pools reserve {carved} connections but max_total_connections is {budget}"
                )));
            }
        }

        for (key, threshold) in &self.thresholds {
            if !key.contains('.') {
                return Err(StrataError::config(format!(
                    "threshold key '{key}' must look like '<repository>.<operation>'"
                )));
            }
            if threshold.warning_ms >= threshold.critical_ms {
                return Err(StrataError::config(format!(
                    "threshold '{key}': warning_ms must be below critical_ms"
                )));
            }
        }

        if self.cache.default_ttl_secs == 0 {
            return Err(StrataError::config("cache.default_ttl_secs must be greater than 0"));
        }
        if self.cache.scan_batch_size == 0 {
            return Err(StrataError::config("cache.scan_batch_size must be greater than 0"));
        }

        let monitor = &self.monitor;
        if monitor.ring_capacity < 2 || monitor.flush_batch_size == 0 || monitor.percentile_window == 0
        {
            return Err(StrataError::config(
                "monitor: ring_capacity >= 2, flush_batch_size > 0 and percentile_window > 0 are required",
            ));
        }
        if monitor.regression_threshold <= 0.0 {
            return Err(StrataError::config(
                "monitor.regression_threshold must be positive",
            ));
        }

        Ok(())
    }
}
