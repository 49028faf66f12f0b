//! Supply-chain tracker entry point.
//!
//! Connects a session to the ledger (a JSON-RPC node, or the in-process
//! ledger for `RPC_URL=memory://`), starts a background indexer mirroring
//! contract events into SQLite, and serves the Axum REST API.

use std::sync::Arc;

use anyhow::Context;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tracker::api::{self, ApiState};
use tracker::artifact::ContractArtifact;
use tracker::config::Config;
use tracker::db;
use tracker::gateway::memory::MemoryLedger;
use tracker::gateway::rpc::RpcGateway;
use tracker::gateway::LedgerGateway;
use tracker::indexer::{self, IndexerState};
use tracker::session::Session;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    let artifact = ContractArtifact::load(&config.contract_artifact).await?;

    // ─── Ledger gateway ───────────────────────────────────
    let gateway: Arc<dyn LedgerGateway> = if config.uses_memory_ledger() {
        let owner = config
            .owner_address
            .clone()
            .context("OWNER_ADDRESS is required with the in-process ledger")?;
        info!("Using in-process ledger (owner {owner})");
        Arc::new(MemoryLedger::new(config.expected_chain_id, owner))
    } else {
        let deployment = artifact.deployment(config.expected_chain_id)?;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.submit_timeout_secs))
            .build()?;
        info!("Using ledger node at {}", config.rpc_url);
        Arc::new(RpcGateway::new(
            client,
            &config.rpc_url,
            deployment.address.clone(),
            config.events_per_page,
        ))
    };

    let session = Arc::new(Session::connect(gateway, &artifact, config.session_settings()).await?);

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // ─── Background indexer ───────────────────────────────
    let cancel = CancellationToken::new();
    let indexer_state = Arc::new(IndexerState {
        pool: pool.clone(),
        gateway: session.gateway(),
        store: session.store().clone(),
        config: config.clone(),
    });
    let indexer_task = tokio::spawn(indexer::run(indexer_state, cancel.clone()));

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(Arc::new(ApiState {
        session,
        pool: Some(pool),
    }));

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    indexer_task.await?;
    Ok(())
}
