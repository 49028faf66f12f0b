//! Long-running background task that mirrors the ledger's event log into
//! SQLite and invalidates cached products whose events arrived.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::db;
use crate::errors::Result;
use crate::gateway::LedgerGateway;
use crate::store::ProductStore;

pub struct IndexerState {
    pub pool: SqlitePool,
    pub gateway: Arc<dyn LedgerGateway>,
    pub store: Arc<ProductStore>,
    pub config: Config,
}

/// Poll until `cancel` fires.
pub async fn run(state: Arc<IndexerState>, cancel: CancellationToken) {
    // Load the cursor from the DB; fall back to config start_block.
    let mut next_block = match db::get_next_block(&state.pool).await {
        Ok(Some(block)) => block,
        Ok(None) => state.config.start_block,
        Err(e) => {
            error!("Could not read mirror cursor: {e}");
            state.config.start_block
        }
    };

    info!("Indexer resuming from block {next_block}");

    loop {
        match poll_once(&state, next_block).await {
            Ok(next) => next_block = next,
            Err(e) => error!("Indexer poll error: {e}"),
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Indexer stopped at block {next_block}");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(state.config.poll_interval_secs)) => {}
        }
    }
}

/// Mirror at most one page of blocks starting at `from_block`.
///
/// Returns the first block of the next page.
pub async fn poll_once(state: &IndexerState, from_block: u64) -> Result<u64> {
    let latest = state.gateway.latest_block().await?;
    if from_block > latest {
        debug!("Mirror is at head (block {latest})");
        return Ok(from_block);
    }

    let span = state.config.blocks_per_page.max(1);
    let to_block = latest.min(from_block.saturating_add(span - 1));
    let events = state.gateway.query_events(from_block, to_block).await?;

    if !events.is_empty() {
        let inserted = db::insert_events(&state.pool, &events).await?;
        info!(
            "Blocks {from_block}..={to_block}: {} events → {inserted} new records stored",
            events.len()
        );

        let touched: BTreeSet<u64> = events.iter().filter_map(|e| e.product_id()).collect();
        for id in touched {
            state.store.invalidate(id).await;
        }
    }

    let next = to_block + 1;
    // Persist cursor so restarts are deterministic.
    db::save_cursor(&state.pool, next).await?;
    Ok(next)
}
