//! Canonical event types emitted by the supply-chain contract, and the
//! attributed records the projector builds from them.

use agri_lifecycle::{Action, Address, Role, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name shown for an actor whose profile cannot be resolved.
pub const UNKNOWN_PARTICIPANT: &str = "Unknown";

/// Name shown for the contract owner, who has no participant profile.
pub const OWNER_LABEL: &str = "Owner";

/// All recognised lifecycle events. Each one corresponds to exactly one
/// [`Action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ProductRegistered,
    ProductPlanted,
    ProductHarvested,
    ProductProcessed,
    ProductDistributed,
    ProductReceived,
    ProductSold,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::ProductRegistered,
        EventKind::ProductPlanted,
        EventKind::ProductHarvested,
        EventKind::ProductProcessed,
        EventKind::ProductDistributed,
        EventKind::ProductReceived,
        EventKind::ProductSold,
    ];

    /// Parse the event name as emitted by the contract. Unrecognised names
    /// yield `None` and are skipped by consumers.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProductRegistered => "ProductRegistered",
            Self::ProductPlanted => "ProductPlanted",
            Self::ProductHarvested => "ProductHarvested",
            Self::ProductProcessed => "ProductProcessed",
            Self::ProductDistributed => "ProductDistributed",
            Self::ProductReceived => "ProductReceived",
            Self::ProductSold => "ProductSold",
        }
    }

    pub fn for_action(action: Action) -> Self {
        match action {
            Action::Register => Self::ProductRegistered,
            Action::Plant => Self::ProductPlanted,
            Action::Harvest => Self::ProductHarvested,
            Action::Process => Self::ProductProcessed,
            Action::Distribute => Self::ProductDistributed,
            Action::Receive => Self::ProductReceived,
            Action::Sell => Self::ProductSold,
        }
    }

    pub fn action(self) -> Action {
        match self {
            Self::ProductRegistered => Action::Register,
            Self::ProductPlanted => Action::Plant,
            Self::ProductHarvested => Action::Harvest,
            Self::ProductProcessed => Action::Process,
            Self::ProductDistributed => Action::Distribute,
            Self::ProductReceived => Action::Receive,
            Self::ProductSold => Action::Sell,
        }
    }

    /// Stage the product reached when this event was emitted.
    pub fn stage(self) -> Stage {
        self.action().result()
    }

    /// Role of the account that caused the event.
    pub fn actor_role(self) -> Role {
        self.action().required_role()
    }

    /// Event argument carrying the acting account.
    pub fn actor_field(self) -> &'static str {
        match self.actor_role() {
            Role::Owner => "owner",
            Role::Farmer => "farmer",
            Role::Processor => "processor",
            Role::Distributor => "distributor",
            Role::Retailer => "retailer",
            Role::Guest => "caller",
        }
    }
}

/// An event as returned by the ledger's event query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    pub block_height: u64,
    /// Position within the block; orders events sharing a height.
    #[serde(default)]
    pub log_index: u32,
    pub tx_hash: String,
    /// Block time in Unix seconds, when the ledger reports it.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl RawEvent {
    /// The `id` argument as a product id. Accepts JSON numbers and decimal
    /// or `0x` strings.
    pub fn product_id(&self) -> Option<u64> {
        self.args
            .get("id")
            .and_then(|v| crate::contract::decode_u64(v).ok())
            .filter(|id| *id > 0)
    }

    pub fn address_arg(&self, key: &str) -> Option<Address> {
        self.args
            .get(key)
            .and_then(|v| crate::contract::decode_address(v).ok().flatten())
    }

    pub fn ordering_key(&self) -> (u64, u32) {
        (self.block_height, self.log_index)
    }
}

/// One line of the audit trail: a lifecycle event attributed to a
/// participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub event_kind: EventKind,
    pub product_id: u64,
    pub actor: Option<Address>,
    pub participant_role: Role,
    pub participant_name: String,
    pub block_height: u64,
    pub log_index: u32,
    pub tx_hash: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl TransactionRecord {
    pub fn ordering_key(&self) -> (u64, u32) {
        (self.block_height, self.log_index)
    }
}

/// Headline figures for a trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrailSummary {
    pub total: usize,
    pub products: usize,
    pub latest_block: Option<u64>,
    pub latest_event: Option<EventKind>,
}

/// Block-explorer URL for a transaction on a known chain. Unknown chains fall
/// back to Etherscan mainnet.
pub fn explorer_tx_url(chain_id: u64, tx_hash: &str) -> String {
    let base = match chain_id {
        1 => "https://etherscan.io/tx/",
        3 => "https://ropsten.etherscan.io/tx/",
        4 => "https://rinkeby.etherscan.io/tx/",
        5 => "https://goerli.etherscan.io/tx/",
        42 => "https://kovan.etherscan.io/tx/",
        56 => "https://bscscan.com/tx/",
        97 => "https://testnet.bscscan.com/tx/",
        137 => "https://polygonscan.com/tx/",
        80001 => "https://mumbai.polygonscan.com/tx/",
        _ => "https://etherscan.io/tx/",
    };
    format!("{base}{tx_hash}")
}
