use anyhow::{Context, Result, anyhow};
use clickhouse::Client;
use dotenvy::dotenv;
use solana_sdk::signature::{Keypair, Signer, read_keypair_file};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use reward_coordinator::Coordinator;
use reward_coordinator::clock::SystemClock;
use reward_coordinator::config::{CoordinatorConfig, ServiceEndpoints, env_parse};
use reward_coordinator::history::{ClickHouseHistoryStore, HistoryStore, MemoryHistoryStore};
use reward_coordinator::services::{ChainClient, jupiter_swap::JupiterSwap, solana_chain::SolanaChain};

fn init_tracing() {
    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if env_parse("LOG_JSON", false) {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .compact()
            .init();
    }
}

fn load_signer(path: Option<&str>) -> Result<Option<Arc<Keypair>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let keypair = read_keypair_file(path).map_err(|e| anyhow!("failed to read keypair {path}: {e}"))?;
    Ok(Some(Arc::new(keypair)))
}

async fn connect_history(endpoints: &ServiceEndpoints) -> Result<Arc<dyn HistoryStore>> {
    let Some(db_url) = endpoints.clickhouse_url.as_deref() else {
        warn!("[Main] CLICKHOUSE_URL not set, history is kept in memory only");
        return Ok(Arc::new(MemoryHistoryStore::new()));
    };
    let db_client = Client::default()
        .with_url(db_url)
        .with_user(std::env::var("CLICKHOUSE_USER").unwrap_or_else(|_| "default".to_string()))
        .with_password(std::env::var("CLICKHOUSE_PASSWORD").unwrap_or_default());

    db_client
        .query("SELECT 1")
        .fetch_one::<u8>()
        .await
        .context("ClickHouse is not reachable")?;
    info!("[Main] Connection to ClickHouse successful.");

    let store = ClickHouseHistoryStore::new(db_client, endpoints.history_table.clone());
    store.ensure_table().await.context("failed to create history table")?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    // --- Configuration ---
    let endpoints = ServiceEndpoints::from_env()?;
    let signer = load_signer(endpoints.keypair_path.as_deref())?;
    let config = CoordinatorConfig::from_env(signer.as_ref().map(|k| k.pubkey()))?;
    if signer.is_none() {
        warn!("[Main] TREASURY_KEYPAIR_PATH not set, payouts, swaps and burns will fail");
    }
    info!(
        treasury = %config.treasury,
        mint = %config.token_mint,
        distribution_interval_secs = config.cycles.distribution_interval.as_secs(),
        burn_interval_secs = config.cycles.burn_interval.map(|d| d.as_secs()),
        "[Main] configuration loaded"
    );

    // --- Client Initialization ---
    let chain: Arc<dyn ChainClient> = Arc::new(SolanaChain::new(
        endpoints.rpc_url.clone(),
        endpoints.rpc_timeout,
        config.treasury,
        signer.clone(),
    ));
    let swap = JupiterSwap::new(
        endpoints.jupiter_api_url.clone(),
        config.token_mint,
        endpoints.swap_slippage_bps,
        endpoints.rpc_timeout,
        signer,
        Arc::clone(&chain),
    )?;
    info!("[Main] Solana RPC and swap clients initialized.");
    let store = connect_history(&endpoints).await?;

    let coordinator = Coordinator::new(config, chain, Arc::new(swap), store, Arc::new(SystemClock));
    let report = coordinator.start_up().await;
    info!(
        interrupted = report.interrupted.len(),
        needs_remediation = report.needs_remediation.len(),
        "[Main] history reconciled"
    );

    // --- Background Tasks ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = tokio::spawn(coordinator.scheduler().run(shutdown_rx));
    info!("[Main] Scheduler spawned.");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "[Main] failed to listen for shutdown signal");
    }
    info!("[Main] Shutdown requested, letting any running cycle finish.");
    let _ = shutdown_tx.send(true);

    match scheduler.await {
        Ok(Some(outcome)) => info!(?outcome, "[Main] last cycle finished"),
        Ok(None) => {}
        Err(e) => error!(error = %e, "[Main] scheduler task panicked"),
    }
    Ok(())
}
