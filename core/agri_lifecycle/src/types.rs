//! # Types
//!
//! Shared data structures for the supply-chain lifecycle.
//!
//! ## Stage as a forward-only state machine
//!
//! ```text
//! Registered ─► Planted ─► Harvested ─► Processed ─► Distributed ─► InRetail ─► Sold
//! ```
//!
//! A product's stage only ever moves one step to the right. `Sold` is
//! terminal. Which role may take each step lives in [`crate::machine`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::Address;

/// Failure to parse a stage, role or action name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognised {kind}: {value:?}")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Lower-cases and drops whitespace, `_` and `-` so that `"In Retail"`,
/// `"in_retail"` and `"InRetail"` compare equal.
pub(crate) fn normalise(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

// ─────────────────────────────────────────────────────────
// Stage
// ─────────────────────────────────────────────────────────

/// Lifecycle stage of a product. The discriminant is the on-ledger index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Registered = 0,
    Planted = 1,
    Harvested = 2,
    Processed = 3,
    Distributed = 4,
    InRetail = 5,
    Sold = 6,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Registered,
        Stage::Planted,
        Stage::Harvested,
        Stage::Processed,
        Stage::Distributed,
        Stage::InRetail,
        Stage::Sold,
    ];

    pub const fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u64) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i))
            .copied()
    }

    /// The stage one step further along, or `None` at `Sold`.
    pub fn next(self) -> Option<Self> {
        Self::from_index(u64::from(self.index()) + 1)
    }

    pub fn is_terminal(self) -> bool {
        self == Stage::Sold
    }

    /// Identifier form, e.g. `InRetail`.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Registered => "Registered",
            Stage::Planted => "Planted",
            Stage::Harvested => "Harvested",
            Stage::Processed => "Processed",
            Stage::Distributed => "Distributed",
            Stage::InRetail => "InRetail",
            Stage::Sold => "Sold",
        }
    }

    /// Display form, e.g. `In Retail`.
    pub fn label(self) -> &'static str {
        match self {
            Stage::InRetail => "In Retail",
            other => other.as_str(),
        }
    }

    /// Completed / current / pending marker for every stage relative to
    /// `self`. A sold product has every stage completed.
    pub fn progress(self) -> Vec<StageStep> {
        Stage::ALL
            .iter()
            .map(|&stage| {
                let status = if self.is_terminal() || stage < self {
                    StepStatus::Completed
                } else if stage == self {
                    StepStatus::Current
                } else {
                    StepStatus::Pending
                };
                StageStep { stage, status }
            })
            .collect()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Accepts identifier, display and enum-path forms (`InRetail`, `In Retail`,
/// `Stage.InRetail`) as well as the numeric index.
impl FromStr for Stage {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let bare = trimmed.strip_prefix("Stage.").unwrap_or(trimmed);

        if let Ok(index) = bare.parse::<u64>() {
            return Self::from_index(index).ok_or_else(|| ParseError::new("stage", s));
        }

        let wanted = normalise(bare);
        Self::ALL
            .iter()
            .copied()
            .find(|stage| normalise(stage.as_str()) == wanted)
            .ok_or_else(|| ParseError::new("stage", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Current,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStep {
    pub stage: Stage,
    pub status: StepStatus,
}

// ─────────────────────────────────────────────────────────
// Role
// ─────────────────────────────────────────────────────────

/// Capability set of a ledger account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Farmer,
    Processor,
    Distributor,
    Retailer,
    Owner,
    Guest,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Farmer,
        Role::Processor,
        Role::Distributor,
        Role::Retailer,
        Role::Owner,
        Role::Guest,
    ];

    /// Roles the Owner can register participants under.
    pub const PARTICIPANTS: [Role; 4] = [
        Role::Farmer,
        Role::Processor,
        Role::Distributor,
        Role::Retailer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Farmer => "Farmer",
            Role::Processor => "Processor",
            Role::Distributor => "Distributor",
            Role::Retailer => "Retailer",
            Role::Owner => "Owner",
            Role::Guest => "Guest",
        }
    }

    pub fn is_participant(self) -> bool {
        Self::PARTICIPANTS.contains(&self)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalise(s);
        Self::ALL
            .iter()
            .copied()
            .find(|role| normalise(role.as_str()) == wanted)
            .ok_or_else(|| ParseError::new("role", s))
    }
}

// ─────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────

/// A product as read back from the ledger.
///
/// `name` and `description` never change after registration. Each custodian
/// field starts unset and is filled exactly once, by the step its role owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Ledger-assigned identifier, starting at 1 and never reused.
    pub id: u64,
    pub name: String,
    pub description: String,
    pub stage: Stage,
    pub farmer: Option<Address>,
    pub processor: Option<Address>,
    pub distributor: Option<Address>,
    pub retailer: Option<Address>,
}

impl Product {
    /// The account recorded for `role`'s custody step, if any.
    pub fn custodian(&self, role: Role) -> Option<&Address> {
        match role {
            Role::Farmer => self.farmer.as_ref(),
            Role::Processor => self.processor.as_ref(),
            Role::Distributor => self.distributor.as_ref(),
            Role::Retailer => self.retailer.as_ref(),
            Role::Owner | Role::Guest => None,
        }
    }

    /// Case-insensitive substring match over name and description.
    pub fn matches(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.name.to_lowercase().contains(&needle)
            || self.description.to_lowercase().contains(&needle)
    }
}

/// Name and location recorded for a registered participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub location: String,
}

/// A registered supply-chain participant. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub address: Address,
    pub role: Role,
    pub name: String,
    pub location: String,
}

impl Participant {
    pub fn profile(&self) -> Profile {
        Profile {
            name: self.name.clone(),
            location: self.location.clone(),
        }
    }
}
