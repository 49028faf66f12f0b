//! Action dispatch: local pre-check, ledger submission, confirmed read-back.
//!
//! Each `(product, caller)` pair moves through
//! `Idle → Submitting → {Confirmed | Rejected | Unknown}`. Only one dispatch
//! per pair may be `Submitting`; a second one is refused locally with
//! `AlreadyInProgress` and never reaches the ledger.
//!
//! The stage reported back to the caller always comes from a ledger read
//! taken after the submission, never from the locally computed next stage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use agri_lifecycle::{
    authorize_register, check, Action, Address, Product, Role, Stage, TransitionError,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::SessionSettings;
use crate::contract;
use crate::errors::{Result, TrackerError};
use crate::gateway::{LedgerGateway, Submission};
use crate::registry::ParticipantRegistry;
use crate::store::ProductStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Idle,
    Submitting,
    Confirmed,
    Rejected,
    /// Submitted but the outcome could not be established.
    Unknown,
}

/// Result of an accepted dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Confirmation {
    pub product_id: u64,
    pub action: Action,
    /// Stage read back from the ledger after acceptance.
    pub stage: Stage,
    pub tx_hash: Option<String>,
    /// False when the read-back had not yet caught up with the accepted call.
    pub caught_up: bool,
}

type DispatchKey = (u64, Address);

/// Claim on a `(product, caller)` pair. Dropping it records the final state.
/// An abandoned dispatch records `Idle` if nothing was sent, else `Unknown`.
struct Ticket<'a> {
    states: &'a Mutex<HashMap<DispatchKey, DispatchState>>,
    key: DispatchKey,
    sent: AtomicBool,
    settled: Option<DispatchState>,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        let state = match self.settled {
            Some(state) => state,
            None if self.sent.load(Ordering::Acquire) => {
                warn!(
                    "Product {}: dispatch by {} abandoned after submission",
                    self.key.0,
                    self.key.1.short()
                );
                DispatchState::Unknown
            }
            None => DispatchState::Idle,
        };
        lock(self.states).insert(self.key.clone(), state);
    }
}

fn lock(
    states: &Mutex<HashMap<DispatchKey, DispatchState>>,
) -> MutexGuard<'_, HashMap<DispatchKey, DispatchState>> {
    states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ActionDispatcher {
    gateway: Arc<dyn LedgerGateway>,
    registry: Arc<ParticipantRegistry>,
    store: Arc<ProductStore>,
    settings: SessionSettings,
    states: Mutex<HashMap<DispatchKey, DispatchState>>,
}

impl ActionDispatcher {
    pub fn new(
        gateway: Arc<dyn LedgerGateway>,
        registry: Arc<ParticipantRegistry>,
        store: Arc<ProductStore>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            gateway,
            registry,
            store,
            settings,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Current state of the pair's most recent dispatch.
    pub fn state(&self, product_id: u64, caller: &Address) -> DispatchState {
        lock(&self.states)
            .get(&(product_id, caller.clone()))
            .copied()
            .unwrap_or(DispatchState::Idle)
    }

    fn acquire(&self, product_id: u64, caller: &Address) -> Result<Ticket<'_>> {
        let key = (product_id, caller.clone());
        let mut states = lock(&self.states);
        if states.get(&key) == Some(&DispatchState::Submitting) {
            return Err(TrackerError::AlreadyInProgress {
                product_id,
                caller: caller.clone(),
            });
        }
        states.insert(key.clone(), DispatchState::Submitting);
        Ok(Ticket {
            states: &self.states,
            key,
            sent: AtomicBool::new(false),
            settled: None,
        })
    }

    /// Apply `action` to a product on behalf of `caller`.
    pub async fn dispatch(
        &self,
        product_id: u64,
        action: Action,
        caller: &Address,
    ) -> Result<Confirmation> {
        if action == Action::Register {
            if self.known_stage(product_id).await?.is_terminal() {
                return Err(TransitionError::TerminalState { action }.into());
            }
            return Err(TrackerError::InvalidTransition(
                "products are created by registration, not dispatched".to_string(),
            ));
        }

        let mut ticket = self.acquire(product_id, caller)?;
        let result = self.submit(product_id, action, caller, &ticket.sent).await;
        ticket.settled = Some(match &result {
            Ok(_) => DispatchState::Confirmed,
            Err(TrackerError::Unknown { .. }) => DispatchState::Unknown,
            Err(_) => DispatchState::Rejected,
        });
        result
    }

    async fn submit(
        &self,
        product_id: u64,
        action: Action,
        caller: &Address,
        sent: &AtomicBool,
    ) -> Result<Confirmation> {
        let role = self.registry.resolve_role(caller).await?;
        let (current, expected) = self.precheck(product_id, role, action).await?;

        let function = contract::action_function(action);
        info!(
            "Submitting {function}({product_id}) as {role} {}",
            caller.short()
        );
        sent.store(true, Ordering::Release);
        let outcome = self.send_bounded(function, &[json!(product_id)], caller).await;

        match outcome {
            Err(e) => Err(e),
            Ok(Submission::Undetermined { detail }) => {
                Err(self.reconcile(product_id, &detail).await)
            }
            Ok(Submission::Rejected { reason }) => {
                if let Err(e) = self.store.refresh_stage(product_id).await {
                    warn!("Product {product_id}: stage refresh after rejection failed: {e}");
                }
                warn!(
                    "{function}({product_id}) rejected: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                Err(reason.map_or(TrackerError::ActionFailed, TrackerError::Rejected))
            }
            Ok(Submission::Accepted { tx_hash, .. }) => {
                Ok(self.confirm(product_id, action, current, expected, tx_hash).await)
            }
        }
    }

    /// Cached stage, else a ledger read.
    async fn known_stage(&self, product_id: u64) -> Result<Stage> {
        match self.store.cached_stage(product_id).await {
            Some(stage) => Ok(stage),
            None => Ok(self.store.get(product_id).await?.stage),
        }
    }

    /// Local pre-check, advisory only; the ledger re-validates. A stage
    /// mismatch against the cache is re-checked once against a fresh read.
    async fn precheck(&self, product_id: u64, role: Role, action: Action) -> Result<(Stage, Stage)> {
        let cached = self.store.cached_stage(product_id).await;
        let current = match cached {
            Some(stage) => stage,
            None => self.store.get(product_id).await?.stage,
        };
        match check(current, role, action) {
            Ok(expected) => Ok((current, expected)),
            Err(TransitionError::InvalidTransition { .. }) if cached.is_some() => {
                let fresh = self.store.refresh_stage(product_id).await?;
                debug!("Product {product_id}: cached {current} failed pre-check, ledger shows {fresh}");
                let expected = check(fresh, role, action)?;
                Ok((fresh, expected))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send with the configured bound on waiting for acknowledgment.
    async fn send_bounded(
        &self,
        function: &str,
        args: &[Value],
        caller: &Address,
    ) -> Result<Submission> {
        match tokio::time::timeout(
            self.settings.submit_timeout,
            self.gateway.send(function, args, caller),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Ok(Submission::Undetermined {
                detail: format!(
                    "no acknowledgment within {}s",
                    self.settings.submit_timeout.as_secs_f32()
                ),
            }),
        }
    }

    /// Re-read the stage of a product whose submission outcome is unknown.
    async fn reconcile(&self, product_id: u64, detail: &str) -> TrackerError {
        let observed = match self.store.refresh_stage(product_id).await {
            Ok(stage) => Some(stage),
            Err(e) => {
                warn!("Product {product_id}: reconcile read failed: {e}");
                None
            }
        };
        warn!("Product {product_id}: submission outcome unknown ({detail}), ledger shows {observed:?}");
        TrackerError::Unknown {
            product_id,
            observed,
        }
    }

    async fn confirm(
        &self,
        product_id: u64,
        action: Action,
        before: Stage,
        expected: Stage,
        tx_hash: Option<String>,
    ) -> Confirmation {
        let attempts = self.settings.confirm_attempts.max(1);
        let mut observed = None;
        for attempt in 1..=attempts {
            match self.store.refresh_stage(product_id).await {
                Ok(stage) => {
                    observed = Some(stage);
                    if stage >= expected {
                        break;
                    }
                }
                Err(e) => warn!("Product {product_id}: confirmation read failed: {e}"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.confirm_delay).await;
            }
        }

        let caught_up = observed.is_some_and(|stage| stage >= expected);
        if caught_up {
            info!("Product {product_id}: {} confirmed at {expected}", action.as_str());
        } else {
            warn!(
                "Product {product_id}: {} accepted but ledger still shows {observed:?}",
                action.as_str()
            );
        }
        Confirmation {
            product_id,
            action,
            stage: observed.unwrap_or(before),
            tx_hash,
            caught_up,
        }
    }

    /// Create a product. Owner only.
    pub async fn register_product(
        &self,
        caller: &Address,
        name: &str,
        description: &str,
    ) -> Result<Product> {
        let role = self.registry.resolve_role(caller).await?;
        authorize_register(role)?;

        let (name, description) = (name.trim(), description.trim());
        if name.is_empty() || description.is_empty() {
            return Err(TrackerError::InvalidInput(
                "product name and description are required".to_string(),
            ));
        }

        let function = contract::action_function(Action::Register);
        let outcome = self
            .send_bounded(function, &[json!(name), json!(description)], caller)
            .await?;
        let id = match outcome {
            Submission::Accepted { output, .. } => match output.as_ref().map(contract::decode_u64) {
                Some(Ok(id)) => id,
                _ => self.store.count().await?,
            },
            Submission::Rejected { reason } => {
                return Err(reason.map_or(TrackerError::ActionFailed, TrackerError::Rejected));
            }
            Submission::Undetermined { detail } => {
                return Err(TrackerError::Unconfirmed(format!(
                    "registration of {name:?}: {detail}"
                )));
            }
        };

        info!("Registered product {id} ({name})");
        self.store.fetch(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory::MemoryLedger;

    fn owner() -> Address {
        Address::from_low_u64(0x0a)
    }

    fn farmer() -> Address {
        Address::from_low_u64(0x01)
    }

    async fn fixture() -> (Arc<MemoryLedger>, ActionDispatcher) {
        let ledger = Arc::new(MemoryLedger::new(1337, owner()));
        ledger
            .send("addFarmer", &[json!(farmer().as_str()), json!("Asha"), json!("Nashik")], &owner())
            .await
            .unwrap();
        let gateway: Arc<dyn LedgerGateway> = ledger.clone();
        let registry = Arc::new(ParticipantRegistry::new(gateway.clone()));
        let store = Arc::new(ProductStore::new(gateway.clone()));
        let settings = SessionSettings {
            confirm_delay: std::time::Duration::from_millis(1),
            ..SessionSettings::default()
        };
        let dispatcher = ActionDispatcher::new(gateway, registry, store, settings);
        (ledger, dispatcher)
    }

    #[tokio::test]
    async fn register_then_plant() {
        let (_, dispatcher) = fixture().await;
        let product = dispatcher
            .register_product(&owner(), "Rice", "Basmati")
            .await
            .unwrap();
        assert_eq!(product.id, 1);
        assert_eq!(product.stage, Stage::Registered);

        let confirmation = dispatcher
            .dispatch(1, Action::Plant, &farmer())
            .await
            .unwrap();
        assert_eq!(confirmation.stage, Stage::Planted);
        assert!(confirmation.caught_up);
        assert!(confirmation.tx_hash.is_some());
        assert_eq!(dispatcher.state(1, &farmer()), DispatchState::Confirmed);
    }

    #[tokio::test]
    async fn only_owner_registers_products() {
        let (ledger, dispatcher) = fixture().await;
        let sent = ledger.submission_count();
        let err = dispatcher
            .register_product(&farmer(), "Rice", "Basmati")
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Unauthorized(_)));
        assert_eq!(ledger.submission_count(), sent);
    }

    #[tokio::test]
    async fn blank_product_fields_are_refused() {
        let (_, dispatcher) = fixture().await;
        assert!(matches!(
            dispatcher.register_product(&owner(), "  ", "Basmati").await,
            Err(TrackerError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn register_is_not_dispatchable() {
        let (_, dispatcher) = fixture().await;
        dispatcher
            .register_product(&owner(), "Rice", "Basmati")
            .await
            .unwrap();
        assert!(matches!(
            dispatcher.dispatch(1, Action::Register, &owner()).await,
            Err(TrackerError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn failed_precheck_settles_as_rejected() {
        let (ledger, dispatcher) = fixture().await;
        dispatcher
            .register_product(&owner(), "Rice", "Basmati")
            .await
            .unwrap();
        let sent = ledger.submission_count();

        let err = dispatcher
            .dispatch(1, Action::Harvest, &farmer())
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::InvalidTransition(_)));
        assert_eq!(ledger.submission_count(), sent);
        assert_eq!(dispatcher.state(1, &farmer()), DispatchState::Rejected);
    }

    #[tokio::test]
    async fn unknown_product_is_not_found() {
        let (_, dispatcher) = fixture().await;
        assert!(matches!(
            dispatcher.dispatch(7, Action::Plant, &farmer()).await,
            Err(TrackerError::NotFound(_))
        ));
    }
}
