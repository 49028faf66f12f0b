//! Application configuration loaded from environment variables.

use std::time::Duration;

use agri_lifecycle::Address;

use crate::errors::{Result, TrackerError};

/// `RPC_URL` value selecting the in-process ledger.
pub const MEMORY_LEDGER_URL: &str = "memory://";

#[derive(Debug, Clone)]
pub struct Config {
    /// Ledger node JSON-RPC endpoint, or `memory://` for the in-process ledger
    pub rpc_url: String,
    /// Path to the contract address/interface descriptor
    pub contract_artifact: String,
    /// Chain id the gateway must report before any interaction
    pub expected_chain_id: u64,
    /// Path to the SQLite event mirror
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// How often (in seconds) the indexer polls for new blocks
    pub poll_interval_secs: u64,
    /// Maximum block span mirrored per poll
    pub blocks_per_page: u64,
    /// Page size for event queries
    pub events_per_page: u32,
    /// Block to start mirroring from if no cursor is saved
    pub start_block: u64,
    /// Bound on waiting for a submission to be acknowledged
    pub submit_timeout_secs: u64,
    /// Re-reads after acceptance while the new stage becomes visible
    pub confirm_attempts: u32,
    /// Delay between those re-reads
    pub confirm_delay_ms: u64,
    /// Owner account of the in-process ledger
    pub owner_address: Option<Address>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            rpc_url: env_var("RPC_URL").unwrap_or_else(|_| MEMORY_LEDGER_URL.to_string()),
            contract_artifact: env_var("CONTRACT_ARTIFACT")
                .unwrap_or_else(|_| "./contracts/AgriSupplyChain.json".to_string()),
            expected_chain_id: parsed("EXPECTED_CHAIN_ID", "1337")?,
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./agri_events.db".to_string()),
            api_port: parsed("API_PORT", "3001")?,
            poll_interval_secs: parsed("POLL_INTERVAL_SECS", "5")?,
            blocks_per_page: parsed("BLOCKS_PER_PAGE", "500")?,
            events_per_page: parsed("EVENTS_PER_PAGE", "100")?,
            start_block: parsed("START_BLOCK", "0")?,
            submit_timeout_secs: parsed("SUBMIT_TIMEOUT_SECS", "30")?,
            confirm_attempts: parsed("CONFIRM_ATTEMPTS", "5")?,
            confirm_delay_ms: parsed("CONFIRM_DELAY_MS", "500")?,
            owner_address: match env_var("OWNER_ADDRESS") {
                Ok(raw) => Some(Address::parse(&raw).map_err(|e| {
                    TrackerError::Config(format!("Invalid OWNER_ADDRESS: {e}"))
                })?),
                Err(_) => None,
            },
        })
    }

    pub fn uses_memory_ledger(&self) -> bool {
        self.rpc_url == MEMORY_LEDGER_URL
    }

    /// Timing knobs handed to the session.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            expected_chain_id: self.expected_chain_id,
            submit_timeout: Duration::from_secs(self.submit_timeout_secs),
            confirm_attempts: self.confirm_attempts,
            confirm_delay: Duration::from_millis(self.confirm_delay_ms),
        }
    }
}

/// Settings the session needs, separated from process-level configuration so
/// tests can build sessions without touching the environment.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub expected_chain_id: u64,
    pub submit_timeout: Duration,
    pub confirm_attempts: u32,
    pub confirm_delay: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            expected_chain_id: 1337,
            submit_timeout: Duration::from_secs(30),
            confirm_attempts: 5,
            confirm_delay: Duration::from_millis(500),
        }
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| TrackerError::Config(format!("Missing env var: {key}")))
}

fn parsed<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    env_var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| TrackerError::Config(format!("Invalid {key}")))
}
