//! One-shot readiness probe for pools and the cache backend

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use strata_core::KvStore;
use strata_data::layer::open_kv_store;
use strata_data::pool::postgres::PgConnector;
use strata_data::{HealthStatus, PoolManager};
use tracing::warn;

use crate::load_config;

#[derive(Parser, Debug)]
pub struct HealthArgs {
    /// Emit a JSON report instead of text
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: HealthArgs, config_path: Option<&PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;

    let connector =
        PgConnector::from_url(&config.database_url).context("Invalid database_url")?;
    let pools = PoolManager::new(connector);
    for (name, settings) in &config.pools {
        if let Err(e) = pools.create_pool(name, *settings).await {
            warn!(pool = %name, error = %e, "pool could not be opened");
        }
    }
    for name in pools.pool_names() {
        pools.check_health(&name).await?;
    }
    let report = pools.health_report();

    let cache_ok = match open_kv_store(&config).await {
        Ok(store) => store.ping().await.is_ok(),
        Err(_) => false,
    };
    pools.shutdown().await;

    let opened: Vec<&str> = report.iter().map(|(name, _, _)| name.as_str()).collect();
    let missing: Vec<&String> = config
        .pools
        .keys()
        .filter(|name| !opened.contains(&name.as_str()))
        .collect();
    let healthy = missing.is_empty()
        && cache_ok
        && report
            .iter()
            .all(|(_, _, status)| *status == HealthStatus::Healthy);

    if args.json {
        let pools_json: Vec<_> = report
            .iter()
            .map(|(name, health, status)| {
                json!({
                    "pool": name,
                    "status": status,
                    "latency_ms": health.latency_ms,
                    "consecutive_failures": health.consecutive_failures,
                })
            })
            .collect();
        let out = json!({
            "healthy": healthy,
            "cache": cache_ok,
            "pools": pools_json,
            "unavailable": missing,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for (name, health, status) in &report {
            println!(
                "{name:<12} {status:<10} latency={}ms failures={}",
                health.latency_ms, health.consecutive_failures
            );
        }
        for name in &missing {
            println!("{name:<12} unavailable");
        }
        println!("{:<12} {}", "cache", if cache_ok { "healthy" } else { "unreachable" });
    }

    if !healthy {
        std::process::exit(1);
    }
    Ok(())
}
