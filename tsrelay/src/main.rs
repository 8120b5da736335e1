mod server;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use tsrelay_core::{logging, Config};
use tsrelay_livestream::{
    Catalog, ChannelContext, ChannelCoordinator, DefaultConnector, KeyBuilder, MemoryStore, RedisStore,
    RelayStore, StaticCatalog,
};

use server::RelayServer;

#[derive(Debug, Parser)]
#[command(name = "tsrelay", version, about = "Clustered MPEG-TS live relay")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "TSRELAY_CONFIG")]
    config: Option<String>,

    /// Worker identity; generated from hostname and pid when absent
    #[arg(long, env = "TSRELAY_WORKER_ID")]
    worker_id: Option<String>,
}

/// Generate a unique worker ID for this process
fn generate_worker_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let pid = std::process::id();
    let suffix = nanoid::nanoid!(6);

    format!("{hostname}_{pid}-{suffix}")
}

async fn init_store(config: &Config) -> Result<Arc<dyn RelayStore>> {
    let keys = KeyBuilder::from_config(&config.redis);
    if config.redis_url().is_empty() {
        warn!("Redis not configured, running as a single worker with in-memory state");
        return Ok(Arc::new(MemoryStore::new(keys)));
    }

    let connect_timeout = std::time::Duration::from_secs(config.redis.connect_timeout_seconds);
    let store = RedisStore::connect(config.redis_url(), keys, connect_timeout).await?;
    info!("Connected to Redis");
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = Config::load(cli.config.as_deref())?;

    // 2. Validate (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    let worker_id = cli.worker_id.unwrap_or_else(generate_worker_id);
    info!(worker_id = %worker_id, "tsrelay starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Shared state, catalog and upstream connector
    let store = init_store(&config).await?;
    let catalog: Arc<dyn Catalog> = Arc::new(StaticCatalog::new(
        &config.catalog,
        &config.proxy.default_user_agent,
    ));
    let connector = Arc::new(DefaultConnector::new(config.proxy.connection_timeout())?);
    info!(channels = config.catalog.channels.len(), "Catalog loaded");

    // 5. Channel coordinator
    let coordinator = ChannelCoordinator::new(ChannelContext {
        worker_id,
        store,
        catalog,
        connector,
        config: config.proxy.clone(),
    });

    RelayServer::new(config, coordinator).start().await
}
