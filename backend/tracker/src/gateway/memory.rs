//! In-process ledger running the supply-chain contract.
//!
//! Used for local development (`RPC_URL=memory://`) and as the ledger in
//! tests. It behaves like the deployed contract: the owner registers
//! products and participants, every lifecycle call is re-validated against
//! the stage machine, failures revert with a reason string, product ids
//! start at 1, and each accepted call is mined into its own block with its
//! events.
//!
//! Test controls simulate an unreachable node, submissions held in the
//! mempool, and acknowledgments that arrive late.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use agri_lifecycle::{check, Action, Address, Participant, Product, Role, Stage};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::debug;

use crate::contract;
use crate::errors::{Result, TrackerError};
use crate::events::{EventKind, RawEvent};
use crate::gateway::{LedgerGateway, Submission};

#[derive(Debug, Default)]
struct LedgerState {
    product_count: u64,
    products: BTreeMap<u64, Product>,
    participants: HashMap<Address, Participant>,
    events: Vec<RawEvent>,
    block_height: u64,
}

impl LedgerState {
    fn role_of(&self, owner: &Address, address: &Address) -> Role {
        if address == owner {
            return Role::Owner;
        }
        self.participants
            .get(address)
            .map(|p| p.role)
            .unwrap_or(Role::Guest)
    }

    /// Mine one block holding `events` and return its transaction hash.
    /// Nothing is recorded if the events cannot be indexed.
    fn mine(
        &mut self,
        events: Vec<(EventKind, Map<String, Value>)>,
    ) -> std::result::Result<String, String> {
        let height = self.block_height + 1;
        let tx_hash = format!("0x{height:064x}");
        let timestamp = Utc::now().timestamp();
        let mut mined = Vec::with_capacity(events.len());
        for (index, (kind, args)) in events.into_iter().enumerate() {
            let log_index = u32::try_from(index)
                .map_err(|_| format!("transaction emits more than {} events", u32::MAX))?;
            mined.push(RawEvent {
                name: kind.as_str().to_string(),
                args,
                block_height: height,
                log_index,
                tx_hash: tx_hash.clone(),
                timestamp: Some(timestamp),
            });
        }
        self.block_height = height;
        self.events.extend(mined);
        Ok(tx_hash)
    }
}

pub struct MemoryLedger {
    chain_id: u64,
    owner: Address,
    state: Mutex<LedgerState>,
    offline: AtomicBool,
    paused: watch::Sender<bool>,
    ack_delay_ms: AtomicU64,
    submissions: AtomicUsize,
}

impl MemoryLedger {
    pub fn new(chain_id: u64, owner: Address) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            chain_id,
            owner,
            state: Mutex::new(LedgerState::default()),
            offline: AtomicBool::new(false),
            paused,
            ack_delay_ms: AtomicU64::new(0),
            submissions: AtomicUsize::new(0),
        }
    }

    pub fn owner(&self) -> &Address {
        &self.owner
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ─── Test controls ────────────────────────────────────

    /// Make every call fail as if the node were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Hold submissions before execution until [`Self::resume_submissions`].
    pub fn pause_submissions(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume_submissions(&self) {
        self.paused.send_replace(false);
    }

    /// Execute submissions immediately but delay their acknowledgment.
    pub fn set_ack_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.ack_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of `send` calls that reached the ledger.
    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Append an arbitrary event, e.g. one this client does not understand.
    pub fn inject_event(&self, event: RawEvent) {
        let mut state = self.state();
        state.block_height = state.block_height.max(event.block_height);
        state.events.push(event);
        state.events.sort_by_key(RawEvent::ordering_key);
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TrackerError::GatewayUnavailable(
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }

    async fn wait_until_unpaused(&self) {
        let mut rx = self.paused.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    // ─── Contract execution ───────────────────────────────

    fn execute(&self, function: &str, args: &[Value], caller: &Address) -> Submission {
        let mut state = self.state();
        let outcome = if function == contract::action_function(Action::Register) {
            self.add_product(&mut state, args, caller)
        } else if let Some(action) = contract::action_for_function(function) {
            self.advance(&mut state, action, args, caller)
        } else if let Some(role) = contract::role_for_register_function(function) {
            self.add_participant(&mut state, role, args, caller)
        } else {
            Err(format!("function {function} does not exist"))
        };

        match outcome.and_then(|(events, output)| Ok((state.mine(events)?, output))) {
            Ok((tx_hash, output)) => {
                debug!("{function} mined at block {}", state.block_height);
                Submission::Accepted {
                    tx_hash: Some(tx_hash),
                    output,
                }
            }
            Err(reason) => Submission::Rejected {
                reason: Some(reason),
            },
        }
    }

    fn add_product(
        &self,
        state: &mut LedgerState,
        args: &[Value],
        caller: &Address,
    ) -> std::result::Result<(Vec<(EventKind, Map<String, Value>)>, Option<Value>), String> {
        if caller != &self.owner {
            return Err("Only the owner can add products".to_string());
        }
        let name = string_arg(args, 0).ok_or("Product name required")?;
        let description = string_arg(args, 1).ok_or("Product description required")?;

        state.product_count += 1;
        let id = state.product_count;
        state.products.insert(
            id,
            Product {
                id,
                name,
                description,
                stage: Stage::Registered,
                farmer: None,
                processor: None,
                distributor: None,
                retailer: None,
            },
        );

        let args = event_args(id, "owner", caller);
        Ok((vec![(EventKind::ProductRegistered, args)], Some(json!(id))))
    }

    fn advance(
        &self,
        state: &mut LedgerState,
        action: Action,
        args: &[Value],
        caller: &Address,
    ) -> std::result::Result<(Vec<(EventKind, Map<String, Value>)>, Option<Value>), String> {
        let id = args
            .first()
            .and_then(|v| contract::decode_u64(v).ok())
            .filter(|id| state.products.contains_key(id))
            .ok_or("Invalid product id")?;
        let role = state.role_of(&self.owner, caller);
        let product = state
            .products
            .get_mut(&id)
            .ok_or("Invalid product id")?;

        product.stage = check(product.stage, role, action).map_err(|e| e.to_string())?;
        match action.assigns() {
            Some(Role::Farmer) => product.farmer = Some(caller.clone()),
            Some(Role::Processor) => product.processor = Some(caller.clone()),
            Some(Role::Distributor) => product.distributor = Some(caller.clone()),
            Some(Role::Retailer) => product.retailer = Some(caller.clone()),
            _ => {}
        }

        let kind = EventKind::for_action(action);
        Ok((vec![(kind, event_args(id, kind.actor_field(), caller))], None))
    }

    fn add_participant(
        &self,
        state: &mut LedgerState,
        role: Role,
        args: &[Value],
        caller: &Address,
    ) -> std::result::Result<(Vec<(EventKind, Map<String, Value>)>, Option<Value>), String> {
        if caller != &self.owner {
            return Err("Only the owner can register participants".to_string());
        }
        let address = args
            .first()
            .and_then(|v| contract::decode_address(v).ok().flatten())
            .ok_or("Invalid participant address")?;
        if address == self.owner || state.participants.contains_key(&address) {
            return Err("Participant already registered".to_string());
        }
        let name = string_arg(args, 1).ok_or("Participant name required")?;
        let location = string_arg(args, 2).unwrap_or_default();

        state.participants.insert(
            address.clone(),
            Participant {
                address,
                role,
                name,
                location,
            },
        );
        Ok((Vec::new(), None))
    }

    fn query(&self, function: &str, args: &[Value]) -> Result<Value> {
        let state = self.state();
        match function {
            contract::OWNER => Ok(json!(self.owner.as_str())),
            contract::PRODUCT_COUNT => Ok(json!(state.product_count)),
            contract::PRODUCT => {
                let id = u64_arg(args)?;
                Ok(state
                    .products
                    .get(&id)
                    .map(contract::encode_product)
                    .unwrap_or_else(contract::empty_product))
            }
            contract::SHOW_STAGE => {
                let id = u64_arg(args)?;
                state
                    .products
                    .get(&id)
                    .map(|p| json!(p.stage.label()))
                    .ok_or_else(|| TrackerError::Rejected("Invalid product id".to_string()))
            }
            contract::USER_ROLE => {
                let address = address_arg(args)?;
                Ok(json!(state
                    .participants
                    .get(&address)
                    .map(|p| p.role.as_str())
                    .unwrap_or_default()))
            }
            other => match contract::role_for_profile_function(other) {
                Some(role) => {
                    let address = address_arg(args)?;
                    let profile = state
                        .participants
                        .get(&address)
                        .filter(|p| p.role == role)
                        .map(Participant::profile);
                    Ok(contract::encode_profile(profile.as_ref()))
                }
                None => Err(TrackerError::InvalidInput(format!(
                    "function {other} does not exist"
                ))),
            },
        }
    }
}

#[async_trait]
impl LedgerGateway for MemoryLedger {
    async fn chain_id(&self) -> Result<u64> {
        self.ensure_online()?;
        Ok(self.chain_id)
    }

    async fn read(&self, function: &str, args: &[Value]) -> Result<Value> {
        self.ensure_online()?;
        self.query(function, args)
    }

    async fn send(&self, function: &str, args: &[Value], caller: &Address) -> Result<Submission> {
        self.ensure_online()?;
        self.submissions.fetch_add(1, Ordering::SeqCst);
        self.wait_until_unpaused().await;

        let outcome = self.execute(function, args, caller);

        let delay = self.ack_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(outcome)
    }

    async fn query_events(&self, from_block: u64, to_block: u64) -> Result<Vec<RawEvent>> {
        self.ensure_online()?;
        Ok(self
            .state()
            .events
            .iter()
            .filter(|e| (from_block..=to_block).contains(&e.block_height))
            .cloned()
            .collect())
    }

    async fn latest_block(&self) -> Result<u64> {
        self.ensure_online()?;
        Ok(self.state().block_height)
    }
}

fn string_arg(args: &[Value], index: usize) -> Option<String> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn u64_arg(args: &[Value]) -> Result<u64> {
    args.first()
        .ok_or_else(|| TrackerError::InvalidInput("missing id argument".to_string()))
        .and_then(contract::decode_u64)
}

fn address_arg(args: &[Value]) -> Result<Address> {
    args.first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| TrackerError::InvalidInput("missing address argument".to_string()))
        .and_then(|s| Address::parse(s).map_err(TrackerError::from))
}

fn event_args(id: u64, actor_field: &str, actor: &Address) -> Map<String, Value> {
    let mut args = Map::new();
    args.insert("id".to_string(), json!(id));
    args.insert(actor_field.to_string(), json!(actor.as_str()));
    args
}
