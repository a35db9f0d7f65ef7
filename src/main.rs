use anyhow::Result;
use polyleverage_engine::infrastructure::InMemoryRemoteStore;
use polyleverage_engine::services::{BalanceLedger, PositionManager, PositionStore};
use polyleverage_engine::Config;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    info!("Starting polyleverage position engine");

    let config = Config::from_env();
    info!("Configuration:");
    info!("  Data dir: {}", config.data_dir.display());
    info!("  Remote timeout: {:?}", config.remote_timeout);
    info!("  Sweep interval: {:?}", config.sweep_interval);

    std::fs::create_dir_all(&config.data_dir)?;

    let remote = InMemoryRemoteStore::new();
    let store = Arc::new(PositionStore::open(
        config.positions_path(),
        remote,
        config.remote_timeout,
    ));
    let ledger = Arc::new(BalanceLedger::open(config.ledger_path()));
    let manager = PositionManager::new(Arc::clone(&store), Arc::clone(&ledger));

    let stats = manager.stats().await;
    info!(
        "store ready: {} positions ({} active) across {} users",
        stats.total_positions, stats.active_positions, stats.total_users
    );

    // Liquidation sweep loop. The engine itself is on-demand; this binary
    // is the scheduled caller.
    let mut ticker = tokio::time::interval(config.sweep_interval);
    loop {
        ticker.tick().await;

        let report = manager.sweep_liquidations().await;
        if !report.liquidations.is_empty() {
            info!("sweep liquidated {} positions", report.liquidations.len());
        }
        for err in &report.errors {
            tracing::error!("sweep error: {}", err);
        }

        let resynced = store.resync_pending().await;
        if resynced > 0 {
            info!("resynced {} positions to remote", resynced);
        }
    }
}
