//! Cache maintenance against the configured backend

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use strata_data::layer::open_kv_store;
use strata_data::CacheManager;
use tracing::info;

use crate::load_config;

#[derive(Parser, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommands,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Drop one entry (and its parameterized variants) or a whole namespace
    Invalidate {
        /// Namespace, e.g. "cards" or "cards:owner"
        namespace: String,
        /// Identifier within the namespace; omit to drop the namespace
        id: Option<String>,
    },
    /// Drop every key matching a glob, relative to the key prefix
    InvalidatePattern {
        /// Glob pattern, e.g. "cards:list:*"
        pattern: String,
    },
}

pub async fn run(args: CacheArgs, config_path: Option<&PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_kv_store(&config).await?;
    let cache = CacheManager::new(store, config.cache.clone());

    let removed = match args.command {
        CacheCommands::Invalidate { namespace, id } => {
            cache.invalidate(&namespace, id.as_deref()).await
        }
        CacheCommands::InvalidatePattern { pattern } => cache.invalidate_pattern(&pattern).await,
    };

    info!(removed, "cache invalidation complete");
    println!("Removed {removed} key(s)");
    Ok(())
}
