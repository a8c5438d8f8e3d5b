use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;

use acctgate::config::GatewayConfig;
use acctgate::selection::factory::{StrategyFactory, StrategyManager};
use acctgate::server::upstream::UpstreamClient;
use acctgate::server::{router, ConfigCredentialSource, GatewayState};
use acctgate::storage::SledStore;

fn load_config(path: &PathBuf) -> Result<GatewayConfig> {
    if !path.exists() {
        log::info!("no config at {}, starting from defaults", path.display());
        return Ok(GatewayConfig::default_config());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config at {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config_path = std::env::var("ACCTGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("acctgate.toml"));
    let data_dir = std::env::var("ACCTGATE_DATA_DIR").unwrap_or_else(|_| "acctgate-data".to_string());

    let cfg = load_config(&config_path)?;
    let listen = cfg.listen.clone();
    let default_strategy = cfg.default_strategy.clone();
    let cfg = Arc::new(RwLock::new(cfg));

    let store = Arc::new(SledStore::open(&data_dir).with_context(|| format!("opening store at {data_dir}"))?);
    let factory = StrategyFactory::new(store.clone(), store.clone(), store.clone(), default_strategy);
    let manager = Arc::new(StrategyManager::new(factory));

    let state = GatewayState {
        credentials: Arc::new(ConfigCredentialSource::new(cfg.clone())),
        cfg,
        manager,
        upstream: UpstreamClient::new(),
        last_activity_unix_ms: Arc::new(AtomicU64::new(acctgate::selection::now_unix_ms())),
    };

    let addr: SocketAddr = format!("{}:{}", listen.host, listen.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", listen.host, listen.port))?;

    log::info!("acctgate listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}
