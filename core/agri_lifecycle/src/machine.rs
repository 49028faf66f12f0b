//! # Stage machine
//!
//! Pure decision logic for custody transitions. Nothing here touches the
//! ledger, so callers may run it speculatively before submitting; the
//! ledger re-validates every call on its own.
//!
//! | Action       | Role        | From        | To          |
//! |--------------|-------------|-------------|-------------|
//! | `register`   | Owner       | (new)       | Registered  |
//! | `plant`      | Farmer      | Registered  | Planted     |
//! | `harvest`    | Farmer      | Planted     | Harvested   |
//! | `process`    | Processor   | Harvested   | Processed   |
//! | `distribute` | Distributor | Processed   | Distributed |
//! | `receive`    | Retailer    | Distributed | InRetail    |
//! | `sell`       | Retailer    | InRetail    | Sold        |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{normalise, ParseError, Role, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Register,
    Plant,
    Harvest,
    Process,
    Distribute,
    Receive,
    Sell,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::Register,
        Action::Plant,
        Action::Harvest,
        Action::Process,
        Action::Distribute,
        Action::Receive,
        Action::Sell,
    ];

    pub fn required_role(self) -> Role {
        match self {
            Action::Register => Role::Owner,
            Action::Plant | Action::Harvest => Role::Farmer,
            Action::Process => Role::Processor,
            Action::Distribute => Role::Distributor,
            Action::Receive | Action::Sell => Role::Retailer,
        }
    }

    /// Stage the product must be at. `None` for `register`, which creates
    /// the product instead of advancing one.
    pub fn precondition(self) -> Option<Stage> {
        match self {
            Action::Register => None,
            Action::Plant => Some(Stage::Registered),
            Action::Harvest => Some(Stage::Planted),
            Action::Process => Some(Stage::Harvested),
            Action::Distribute => Some(Stage::Processed),
            Action::Receive => Some(Stage::Distributed),
            Action::Sell => Some(Stage::InRetail),
        }
    }

    pub fn result(self) -> Stage {
        match self {
            Action::Register => Stage::Registered,
            Action::Plant => Stage::Planted,
            Action::Harvest => Stage::Harvested,
            Action::Process => Stage::Processed,
            Action::Distribute => Stage::Distributed,
            Action::Receive => Stage::InRetail,
            Action::Sell => Stage::Sold,
        }
    }

    /// Custodian field this step fills in, named by the role that owns it.
    pub fn assigns(self) -> Option<Role> {
        match self {
            Action::Plant => Some(Role::Farmer),
            Action::Process => Some(Role::Processor),
            Action::Distribute => Some(Role::Distributor),
            Action::Receive => Some(Role::Retailer),
            Action::Register | Action::Harvest | Action::Sell => None,
        }
    }

    /// The single action that advances a product out of `stage`.
    pub fn advancing(stage: Stage) -> Option<Action> {
        Action::ALL
            .iter()
            .copied()
            .find(|action| action.precondition() == Some(stage))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Register => "register",
            Action::Plant => "plant",
            Action::Harvest => "harvest",
            Action::Process => "process",
            Action::Distribute => "distribute",
            Action::Receive => "receive",
            Action::Sell => "sell",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalise(s);
        Action::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == wanted)
            .ok_or_else(|| ParseError::new("action", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("{action} requires the {required} role, caller is {actual}")]
    Unauthorized {
        action: Action,
        required: Role,
        actual: Role,
    },

    #[error("cannot {action} a product at stage {actual}{}", expected_clause(.expected))]
    InvalidTransition {
        action: Action,
        expected: Option<Stage>,
        actual: Stage,
    },

    #[error("product is sold; {action} is no longer possible")]
    TerminalState { action: Action },
}

fn expected_clause(expected: &Option<Stage>) -> String {
    match expected {
        Some(stage) => format!(" (requires {stage})"),
        None => " (it only applies to new products)".to_string(),
    }
}

/// Stage that `action` would move a product at `current` to, ignoring who
/// asks.
pub fn next_stage(current: Stage, action: Action) -> Result<Stage, TransitionError> {
    if current.is_terminal() {
        return Err(TransitionError::TerminalState { action });
    }
    match action.precondition() {
        Some(required) if required == current => Ok(action.result()),
        expected => Err(TransitionError::InvalidTransition {
            action,
            expected,
            actual: current,
        }),
    }
}

/// Full local pre-check: terminal state first, then role, then stage.
pub fn check(current: Stage, role: Role, action: Action) -> Result<Stage, TransitionError> {
    if current.is_terminal() {
        return Err(TransitionError::TerminalState { action });
    }
    let required = action.required_role();
    if role != required {
        return Err(TransitionError::Unauthorized {
            action,
            required,
            actual: role,
        });
    }
    next_stage(current, action)
}

pub fn can_transition(current: Stage, role: Role, action: Action) -> bool {
    check(current, role, action).is_ok()
}

/// Pre-check for creating a product, which has no current stage.
pub fn authorize_register(role: Role) -> Result<Stage, TransitionError> {
    match role {
        Role::Owner => Ok(Action::Register.result()),
        actual => Err(TransitionError::Unauthorized {
            action: Action::Register,
            required: Role::Owner,
            actual,
        }),
    }
}

/// Actions `role` may take on a product at `current` right now.
pub fn available_actions(current: Stage, role: Role) -> Vec<Action> {
    Action::ALL
        .iter()
        .copied()
        .filter(|&action| can_transition(current, role, action))
        .collect()
}
