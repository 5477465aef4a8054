use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use feedmill::config::Config;
use feedmill::engine::Engine;
use feedmill::storage::{Database, DatabaseError};

/// Default config location (~/.config/feedmill/config.toml)
fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("feedmill")
        .join("config.toml"))
}

#[derive(Parser, Debug)]
#[command(name = "feedmill", about = "Feed aggregation daemon", version)]
struct Args {
    /// Config file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file, overriding `database_path` from the config
    #[arg(long, value_name = "FILE")]
    database: Option<String>,

    /// Refresh every active source, retire read items, prune once, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from '{}'", config_path.display()))?;
    if let Some(database) = args.database {
        config.database_path = database;
    }

    let db = match Database::open(&config.database_path).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            anyhow::bail!(
                "Database '{}' is in use by another process",
                config.database_path
            );
        }
        Err(e) => {
            return Err(e).with_context(|| {
                format!("Failed to open database '{}'", config.database_path)
            })
        }
    };

    if args.once {
        let retriever = std::sync::Arc::new(
            feedmill::feed::HttpRetriever::new(config.retrieve_settings())
                .context("Failed to build HTTP client")?,
        );
        let (jobs, _fired) = feedmill::scheduler::TokioJobs::new();
        let engine = Engine::build(config, db, retriever, std::sync::Arc::new(jobs));

        let report = engine.refresh_all(None).await.context("Refresh failed")?;
        let retired = engine.retire_read_items().await.context("Retire failed")?;
        let pruned = engine.prune_now().await.context("Prune failed")?;
        println!(
            "refreshed {} sources ({} failed), {} new items, {} retired, {} pruned",
            report.succeeded, report.failed, report.inserted, retired, pruned.deleted
        );
        return Ok(());
    }

    let mut engine = Engine::start(config, db)
        .await
        .context("Failed to start engine")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    engine.shutdown();
    Ok(())
}
