//! # Ledger gateway boundary
//!
//! The ledger is the only source of truth. Everything the tracker knows is
//! read through [`LedgerGateway`]:
//!
//! * `read` returns current on-chain values,
//! * `send` executes a state-changing call under a caller identity and may be
//!   rejected,
//! * `query_events` returns the historical event log for a block range.
//!
//! Two implementations exist: [`rpc::RpcGateway`] talks JSON-RPC to a ledger
//! node and [`memory::MemoryLedger`] runs the contract in-process.
//! [`GuardedGateway`] wraps either one and stops all traffic once the link is
//! known to be down.

pub mod memory;
pub mod rpc;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use agri_lifecycle::Address;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::{Result, TrackerError};
use crate::events::RawEvent;

/// Outcome of a state-changing call as reported by the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Accepted {
        tx_hash: Option<String>,
        /// Return value of the call, when the ledger reports one.
        output: Option<Value>,
    },
    Rejected {
        reason: Option<String>,
    },
    /// The call may or may not have executed; only a fresh read can tell.
    Undetermined {
        detail: String,
    },
}

#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Chain identifier the node is serving.
    async fn chain_id(&self) -> Result<u64>;

    async fn read(&self, function: &str, args: &[Value]) -> Result<Value>;

    async fn send(&self, function: &str, args: &[Value], caller: &Address) -> Result<Submission>;

    /// Events in `[from_block, to_block]`, ascending.
    async fn query_events(&self, from_block: u64, to_block: u64) -> Result<Vec<RawEvent>>;

    async fn latest_block(&self) -> Result<u64>;
}

/// Anything that can replay the event log: the gateway itself or a local
/// mirror of it.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn query_events(&self, from_block: u64, to_block: u64) -> Result<Vec<RawEvent>>;

    async fn latest_block(&self) -> Result<u64>;
}

/// Exposes a gateway's event log as an [`EventSource`].
#[derive(Clone)]
pub struct LedgerEvents(pub Arc<dyn LedgerGateway>);

#[async_trait]
impl EventSource for LedgerEvents {
    async fn query_events(&self, from_block: u64, to_block: u64) -> Result<Vec<RawEvent>> {
        self.0.query_events(from_block, to_block).await
    }

    async fn latest_block(&self) -> Result<u64> {
        self.0.latest_block().await
    }
}

/// Fail unless the gateway serves `expected`. A mismatch is a configuration
/// error and is never retried.
pub async fn verify_network(gateway: &dyn LedgerGateway, expected: u64) -> Result<u64> {
    let actual = gateway.chain_id().await?;
    if actual != expected {
        return Err(TrackerError::NetworkMismatch { expected, actual });
    }
    info!("Ledger network verified (chain {actual})");
    Ok(actual)
}

// ─────────────────────────────────────────────────────────
// Link health
// ─────────────────────────────────────────────────────────

/// Shared halted/healthy flag for the ledger link.
#[derive(Debug, Default)]
pub struct LinkHealth {
    halted: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl LinkHealth {
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn halt(&self, reason: &str) {
        if let Ok(mut slot) = self.reason.lock() {
            *slot = Some(reason.to_string());
        }
        if !self.halted.swap(true, Ordering::AcqRel) {
            warn!("Ledger link halted: {reason}");
        }
    }

    pub fn restore(&self) {
        if let Ok(mut slot) = self.reason.lock() {
            *slot = None;
        }
        if self.halted.swap(false, Ordering::AcqRel) {
            info!("Ledger link restored");
        }
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().ok().and_then(|slot| slot.clone())
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_halted() {
            let reason = self
                .reason()
                .unwrap_or_else(|| "link halted".to_string());
            return Err(TrackerError::GatewayUnavailable(reason));
        }
        Ok(())
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.halts_ledger() {
                self.halt(&err.to_string());
            }
        }
        result
    }
}

/// Gateway wrapper that refuses all traffic while the link is halted and
/// halts it on the first link-level failure.
pub struct GuardedGateway {
    inner: Arc<dyn LedgerGateway>,
    health: Arc<LinkHealth>,
}

impl GuardedGateway {
    pub fn new(inner: Arc<dyn LedgerGateway>, health: Arc<LinkHealth>) -> Self {
        Self { inner, health }
    }

    /// Re-check the network on the raw gateway and clear the halt on success.
    pub async fn reconnect(&self, expected_chain_id: u64) -> Result<u64> {
        let chain = self
            .health
            .observe(verify_network(self.inner.as_ref(), expected_chain_id).await)?;
        self.health.restore();
        Ok(chain)
    }
}

#[async_trait]
impl LedgerGateway for GuardedGateway {
    async fn chain_id(&self) -> Result<u64> {
        self.health.ensure_available()?;
        self.health.observe(self.inner.chain_id().await)
    }

    async fn read(&self, function: &str, args: &[Value]) -> Result<Value> {
        self.health.ensure_available()?;
        self.health.observe(self.inner.read(function, args).await)
    }

    async fn send(&self, function: &str, args: &[Value], caller: &Address) -> Result<Submission> {
        self.health.ensure_available()?;
        self.health
            .observe(self.inner.send(function, args, caller).await)
    }

    async fn query_events(&self, from_block: u64, to_block: u64) -> Result<Vec<RawEvent>> {
        self.health.ensure_available()?;
        self.health
            .observe(self.inner.query_events(from_block, to_block).await)
    }

    async fn latest_block(&self) -> Result<u64> {
        self.health.ensure_available()?;
        self.health.observe(self.inner.latest_block().await)
    }
}
