//! ChronoDB Server - WAL worker loops and HTTP API

mod api;
mod workers;

use anyhow::Context;
use chronodb_core::{Engine, EngineConfig, PartitionBy};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Data directory
    pub data_dir: PathBuf,
    /// Apply worker loops
    pub apply_workers: usize,
    pub purge_interval: Duration,
    pub auto_create_tables: bool,
    pub auto_create_columns: bool,
    /// Partitioning of auto-created tables
    pub partition_by: PartitionBy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8086)),
            data_dir: PathBuf::from("data"),
            apply_workers: 2,
            purge_interval: Duration::from_millis(chronodb_core::config::PURGE_INTERVAL_MS),
            auto_create_tables: true,
            auto_create_columns: true,
            partition_by: PartitionBy::Day,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `CHRONODB_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(addr) = env_parse("CHRONODB_HTTP_ADDR")? {
            config.http_addr = addr;
        }
        if let Ok(dir) = std::env::var("CHRONODB_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(workers) = env_parse::<usize>("CHRONODB_APPLY_WORKERS")? {
            config.apply_workers = workers.max(1);
        }
        if let Some(millis) = env_parse("CHRONODB_PURGE_INTERVAL_MS")? {
            config.purge_interval = Duration::from_millis(millis);
        }
        if let Some(enabled) = env_parse("CHRONODB_AUTO_CREATE_TABLES")? {
            config.auto_create_tables = enabled;
        }
        if let Some(enabled) = env_parse("CHRONODB_AUTO_CREATE_COLUMNS")? {
            config.auto_create_columns = enabled;
        }
        if let Some(partition_by) = env_parse("CHRONODB_PARTITION_BY")? {
            config.partition_by = partition_by;
        }
        Ok(config)
    }

    fn engine_config(&self) -> EngineConfig {
        let mut engine = EngineConfig {
            data_dir: self.data_dir.clone(),
            ..Default::default()
        };
        engine.purge.interval = self.purge_interval;
        engine.ingest.auto_create_tables = self.auto_create_tables;
        engine.ingest.auto_create_columns = self.auto_create_columns;
        engine.ingest.default_partition_by = self.partition_by;
        engine
    }
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(None),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServerConfig::from_env()?;

    info!("Starting ChronoDB server...");
    info!("Data directory: {:?}", config.data_dir);

    let engine = tokio::task::spawn_blocking({
        let engine_config = config.engine_config();
        move || Engine::open(engine_config)
    })
    .await??;

    let workers = workers::spawn(engine.clone(), config.apply_workers);

    let app = api::create_router(engine);
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("ChronoDB server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    workers.shutdown().await;
    Ok(())
}
