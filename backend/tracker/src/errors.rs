//! Application-wide error types.

use agri_lifecycle::{Address, AddressError, Stage, TransitionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    // ─── Lifecycle taxonomy ───────────────────────────────
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Terminal state: {0}")]
    TerminalState(String),

    #[error("Participant {0} is already registered")]
    DuplicateParticipant(Address),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("An action on product {product_id} by {caller} is already in progress")]
    AlreadyInProgress { product_id: u64, caller: Address },

    #[error("Ledger gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Submission outcome unknown for product {product_id}; ledger now reports {}", observed_clause(.observed))]
    Unknown {
        product_id: u64,
        observed: Option<Stage>,
    },

    /// A registration whose outcome could not be read back.
    #[error("Submission outcome unknown: {0}")]
    Unconfirmed(String),

    /// The ledger refused the call and said why.
    #[error("{0}")]
    Rejected(String),

    /// The ledger refused the call without a reason.
    #[error("Action failed")]
    ActionFailed,

    // ─── Infrastructure ───────────────────────────────────
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Contract not deployed on network {0}")]
    NotDeployed(u64),

    #[error("Wrong network: expected chain {expected}, gateway reports {actual}")]
    NetworkMismatch { expected: u64, actual: u64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Event parse error: {0}")]
    EventParse(String),
}

fn observed_clause(observed: &Option<Stage>) -> String {
    match observed {
        Some(stage) => format!("stage {stage}"),
        None => "no readable stage".to_string(),
    }
}

impl TrackerError {
    /// Conditions that must stop all further ledger interaction until the
    /// link is re-established.
    pub fn halts_ledger(&self) -> bool {
        matches!(
            self,
            TrackerError::GatewayUnavailable(_) | TrackerError::NetworkMismatch { .. }
        )
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerError::Unauthorized(_) => "unauthorized",
            TrackerError::InvalidTransition(_) => "invalid_transition",
            TrackerError::TerminalState(_) => "terminal_state",
            TrackerError::DuplicateParticipant(_) => "duplicate_participant",
            TrackerError::NotFound(_) => "not_found",
            TrackerError::AlreadyInProgress { .. } => "already_in_progress",
            TrackerError::GatewayUnavailable(_) => "gateway_unavailable",
            TrackerError::Unknown { .. } | TrackerError::Unconfirmed(_) => "unknown",
            TrackerError::Rejected(_) | TrackerError::ActionFailed => "action_failed",
            TrackerError::Database(_) | TrackerError::Migrate(_) => "database",
            TrackerError::Http(_) => "http",
            TrackerError::Json(_) | TrackerError::EventParse(_) => "decode",
            TrackerError::Io(_) => "io",
            TrackerError::Config(_) | TrackerError::NotDeployed(_) => "config",
            TrackerError::NetworkMismatch { .. } => "network_mismatch",
            TrackerError::InvalidInput(_) => "invalid_input",
        }
    }
}

impl From<TransitionError> for TrackerError {
    fn from(err: TransitionError) -> Self {
        let message = err.to_string();
        match err {
            TransitionError::Unauthorized { .. } => TrackerError::Unauthorized(message),
            TransitionError::InvalidTransition { .. } => TrackerError::InvalidTransition(message),
            TransitionError::TerminalState { .. } => TrackerError::TerminalState(message),
        }
    }
}

impl From<AddressError> for TrackerError {
    fn from(err: AddressError) -> Self {
        TrackerError::InvalidInput(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use agri_lifecycle::{check, Action, Role};

    #[test]
    fn transition_errors_keep_their_kind() {
        let err: TrackerError = check(Stage::Registered, Role::Processor, Action::Plant)
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), "unauthorized");

        let err: TrackerError = check(Stage::Sold, Role::Retailer, Action::Sell)
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), "terminal_state");
    }

    #[test]
    fn only_link_failures_halt() {
        assert!(TrackerError::GatewayUnavailable("down".into()).halts_ledger());
        assert!(TrackerError::NetworkMismatch {
            expected: 1337,
            actual: 1
        }
        .halts_ledger());
        assert!(!TrackerError::ActionFailed.halts_ledger());
        assert!(!TrackerError::Unknown {
            product_id: 1,
            observed: None
        }
        .halts_ledger());
    }

    #[test]
    fn rejected_reason_is_verbatim() {
        let err = TrackerError::Rejected("Only the farmer can plant".into());
        assert_eq!(err.to_string(), "Only the farmer can plant");
    }
}
