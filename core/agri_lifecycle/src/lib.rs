//! # Agricultural supply-chain lifecycle rules
//!
//! The rules every participant in the supply chain agrees on, independent of
//! any ledger client:
//!
//! | Concern            | Items                                              |
//! |--------------------|----------------------------------------------------|
//! | Identity           | [`Address`]                                        |
//! | Lifecycle          | [`Stage`], [`Product`]                             |
//! | Participants       | [`Role`], [`Participant`], [`Profile`]             |
//! | Transitions        | [`Action`], [`check`], [`next_stage`], [`can_transition`] |
//! | Invariants         | [`check_progression`], [`check_advance`], [`check_custody`] |
//!
//! Everything here is pure. The ledger enforces the same table
//! authoritatively; the client runs it beforehand to avoid doomed
//! submissions.

pub mod address;
pub mod invariants;
pub mod machine;
pub mod types;

pub use address::{Address, AddressError};
pub use invariants::{check_advance, check_custody, check_progression, ProgressionError};
pub use machine::{
    authorize_register, available_actions, can_transition, check, next_stage, Action,
    TransitionError,
};
pub use types::{ParseError, Participant, Product, Profile, Role, Stage, StageStep, StepStatus};
