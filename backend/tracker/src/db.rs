//! Event mirror: schema migrations plus event and cursor queries.
//!
//! The mirror is a disposable local copy of the ledger's event log. Deleting
//! the database only costs a re-scan.

use std::str::FromStr;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::errors::Result;
use crate::events::RawEvent;
use crate::gateway::EventSource;

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    connect(database_url, 5).await
}

async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// Single-connection in-memory mirror.
pub async fn memory_pool() -> Result<SqlitePool> {
    connect("sqlite::memory:", 1).await
}

// ─────────────────────────────────────────────────────────
// Cursor helpers
// ─────────────────────────────────────────────────────────

/// First block not yet mirrored, or `None` before the first poll.
pub async fn get_next_block(pool: &SqlitePool) -> Result<Option<u64>> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT next_block FROM mirror_cursor WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(v,)| v.max(0) as u64))
}

pub async fn save_cursor(pool: &SqlitePool, next_block: u64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO mirror_cursor (id, next_block) VALUES (1, ?1)
        ON CONFLICT(id) DO UPDATE SET next_block = excluded.next_block
        "#,
    )
    .bind(next_block as i64)
    .execute(pool)
    .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Event writes
// ─────────────────────────────────────────────────────────

/// Persist a batch of raw events. Events already mirrored (same
/// `(tx_hash, log_index)`) are ignored, so re-polling a range is harmless.
pub async fn insert_events(pool: &SqlitePool, events: &[RawEvent]) -> Result<usize> {
    let mut count = 0usize;
    for ev in events {
        let args = serde_json::to_string(&ev.args)?;
        let rows_affected = sqlx::query(
            r#"
            INSERT OR IGNORE INTO ledger_events
                (name, product_id, args, block_height, log_index, tx_hash, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&ev.name)
        .bind(ev.product_id().map(|id| id as i64))
        .bind(args)
        .bind(ev.block_height as i64)
        .bind(ev.log_index as i64)
        .bind(&ev.tx_hash)
        .bind(ev.timestamp)
        .execute(pool)
        .await?
        .rows_affected();

        count += rows_affected as usize;
    }
    Ok(count)
}

// ─────────────────────────────────────────────────────────
// Event reads
// ─────────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    name: String,
    args: String,
    block_height: i64,
    log_index: i64,
    tx_hash: String,
    timestamp: Option<i64>,
}

impl EventRow {
    /// `None` for a row whose position cannot be represented.
    fn into_raw(self) -> Option<RawEvent> {
        let (Ok(block_height), Ok(log_index)) =
            (u64::try_from(self.block_height), u32::try_from(self.log_index))
        else {
            warn!(
                "Skipping mirrored event {} at invalid position {}/{}",
                self.tx_hash, self.block_height, self.log_index
            );
            return None;
        };
        let args = serde_json::from_str::<Map<String, Value>>(&self.args).unwrap_or_else(|e| {
            warn!("Mirrored event {} has unreadable args: {e}", self.tx_hash);
            Map::new()
        });
        Some(RawEvent {
            name: self.name,
            args,
            block_height,
            log_index,
            tx_hash: self.tx_hash,
            timestamp: self.timestamp,
        })
    }
}

/// Mirrored events in `[from_block, to_block]`, ordered by block then log index.
pub async fn events_in_range(pool: &SqlitePool, from_block: u64, to_block: u64) -> Result<Vec<RawEvent>> {
    let rows = sqlx::query_as::<_, EventRow>(
        r#"
        SELECT name, args, block_height, log_index, tx_hash, timestamp
        FROM   ledger_events
        WHERE  block_height BETWEEN ?1 AND ?2
        ORDER  BY block_height ASC, log_index ASC
        "#,
    )
    .bind(from_block as i64)
    .bind(to_block.min(i64::MAX as u64) as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().filter_map(EventRow::into_raw).collect())
}

pub async fn count_events(pool: &SqlitePool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ledger_events")
        .fetch_one(pool)
        .await?;
    Ok(n)
}

/// The mirror as an [`EventSource`]. Its head is the last block fully
/// mirrored.
#[derive(Clone)]
pub struct EventMirror {
    pool: SqlitePool,
}

impl EventMirror {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSource for EventMirror {
    async fn query_events(&self, from_block: u64, to_block: u64) -> Result<Vec<RawEvent>> {
        events_in_range(&self.pool, from_block, to_block).await
    }

    async fn latest_block(&self) -> Result<u64> {
        Ok(get_next_block(&self.pool)
            .await?
            .map_or(0, |next| next.saturating_sub(1)))
    }
}
