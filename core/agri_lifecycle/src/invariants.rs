//! Lifecycle invariants checked against ledger-derived data.
//!
//! * A product's stage never decreases.
//! * Replayed from genesis, a product's history is exactly
//!   `Registered, Planted, …` with no gaps and nothing after `Sold`.
//! * A custodian field is set iff the product has passed the step that
//!   assigns it.

use thiserror::Error;

use crate::machine::Action;
use crate::types::{Product, Role, Stage};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgressionError {
    #[error("stage regressed from {from} to {to}")]
    Regressed { from: Stage, to: Stage },

    #[error("history must open at Registered, found {found}")]
    MissingGenesis { found: Stage },

    #[error("stage jumped from {from} to {to}; each step advances exactly one stage")]
    NotConsecutive { from: Stage, to: Stage },

    #[error("{role} custody is {state} at stage {stage}")]
    Custody {
        role: Role,
        stage: Stage,
        state: &'static str,
    },
}

/// Monotonicity for two successive observations of the same product.
pub fn check_advance(before: Stage, after: Stage) -> Result<(), ProgressionError> {
    if after < before {
        return Err(ProgressionError::Regressed {
            from: before,
            to: after,
        });
    }
    Ok(())
}

/// Gap-free progression over an ascending sequence of stages reached by
/// one product.
///
/// With `from_genesis` unset the sequence may open mid-lifecycle (a block
/// range that starts after registration).
pub fn check_progression(stages: &[Stage], from_genesis: bool) -> Result<(), ProgressionError> {
    let Some(&first) = stages.first() else {
        return Ok(());
    };
    if from_genesis && first != Stage::Registered {
        return Err(ProgressionError::MissingGenesis { found: first });
    }
    for pair in stages.windows(2) {
        let (from, to) = (pair[0], pair[1]);
        if from.next() != Some(to) {
            return Err(ProgressionError::NotConsecutive { from, to });
        }
    }
    Ok(())
}

/// Custody fields of a single product record agree with its stage.
pub fn check_custody(product: &Product) -> Result<(), ProgressionError> {
    for action in Action::ALL {
        let Some(role) = action.assigns() else {
            continue;
        };
        let reached = product.stage >= action.result();
        let recorded = product.custodian(role).is_some();
        if reached != recorded {
            return Err(ProgressionError::Custody {
                role,
                stage: product.stage,
                state: if recorded { "set early" } else { "missing" },
            });
        }
    }
    Ok(())
}
