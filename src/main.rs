//! Herald - Entry Point
//!
//! Runs the agent with one log adapter per configured channel. Real
//! deployments register platform adapters in place of the log adapters.

use std::sync::Arc;

use herald::{ChannelAdapter, Config, HeraldService, LogAdapter, MemoryStore, OutcomeStore, RedisStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Herald v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: herald [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --help, -h   Show this help");
        println!();
        println!("Environment variables:");
        println!("  HERALD_REDIS_URL        Redis URL for outcomes + budget state");
        println!("  HERALD_CHANNEL_LIMITS   e.g. twitter=5/50,mastodon=10/100");
        println!("  HERALD_MAX_CONCURRENT   Global worker pool size");
        println!("  HERALD_MAX_ATTEMPTS     Retries before dead-lettering");
        println!("  RUST_LOG                Log filter (default herald=info)");
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "herald=info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Herald v{}", env!("CARGO_PKG_VERSION"));
    let config = Config::from_env()?;

    let store: Arc<dyn OutcomeStore> = match &config.redis_url {
        Some(url) => match RedisStore::connect(url).await {
            Ok(store) => {
                info!("Using redis store");
                Arc::new(store)
            }
            Err(e) => {
                warn!("Redis unavailable ({e}), falling back to in-memory store");
                Arc::new(MemoryStore::new())
            }
        },
        None => {
            info!("No redis configured, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let adapters: Vec<Arc<dyn ChannelAdapter>> = config
        .channel_limits
        .keys()
        .map(|channel| Arc::new(LogAdapter::new(channel)) as Arc<dyn ChannelAdapter>)
        .collect();

    let service = HeraldService::new(config, adapters, store);
    service.start().await;

    wait_for_shutdown_signal().await;
    service.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Could not install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received shutdown signal");
}
