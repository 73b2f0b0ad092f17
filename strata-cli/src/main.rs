//! strata CLI - operator tooling for the strata data-access layer
//!
//! - `config`: create, inspect and validate ~/.strata/config.toml
//! - `health`: open each configured pool once and probe it
//! - `cache`: invalidate namespaces, single entries or raw key patterns

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use strata_core::StrataConfig;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

#[derive(Parser, Debug)]
#[command(
    name = "strata",
    author,
    version,
    about = "Operator tooling for the strata cache-aside data layer"
)]
struct Cli {
    /// Config file (defaults to $STRATA_CONFIG or ~/.strata/config.toml)
    #[arg(long, short = 'c', global = true, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage strata configuration (init, show, validate, path)
    Config(config::ConfigArgs),
    /// Probe every configured pool and the cache backend
    Health(commands::health::HealthArgs),
    /// Cache maintenance (invalidate, invalidate-pattern)
    Cache(commands::cache::CacheArgs),
}

/// Load config from an explicit path, or the default location.
pub(crate) fn load_config(path: Option<&PathBuf>) -> Result<StrataConfig> {
    let config = match path {
        Some(path) => StrataConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => StrataConfig::load()?,
    };
    Ok(config)
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow!(err))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Config(args) => config::run_config(args, cli.config.as_ref())?,
        Commands::Health(args) => commands::health::run(args, cli.config.as_ref()).await?,
        Commands::Cache(args) => commands::cache::run(args, cli.config.as_ref()).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cache_invalidate_with_optional_id() {
        let cli = Cli::try_parse_from(["strata", "cache", "invalidate", "cards", "abc"]).unwrap();
        match cli.command {
            Commands::Cache(args) => match args.command {
                commands::cache::CacheCommands::Invalidate { namespace, id } => {
                    assert_eq!(namespace, "cards");
                    assert_eq!(id.as_deref(), Some("abc"));
                }
                other => panic!("unexpected command: {other:?}"),
            },
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::try_parse_from(["strata", "cache", "invalidate", "cards"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cache(commands::cache::CacheArgs {
                command: commands::cache::CacheCommands::Invalidate { id: None, .. }
            })
        ));
    }

    #[test]
    fn global_config_flag_is_accepted_after_subcommand() {
        let cli = Cli::try_parse_from(["strata", "health", "--config", "/tmp/strata.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/strata.toml")));
    }
}
