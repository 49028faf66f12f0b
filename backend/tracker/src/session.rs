//! Connected session: one verified ledger link and the components built on
//! it, plus the identity currently acting through it.
//!
//! A session is constructed once and shared by reference. Changing the
//! acting account drops every cached resolution so roles and products are
//! re-read for the new identity.

use std::sync::Arc;

use agri_lifecycle::{Address, Role};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::artifact::ContractArtifact;
use crate::config::SessionSettings;
use crate::dispatcher::ActionDispatcher;
use crate::errors::Result;
use crate::events::explorer_tx_url;
use crate::gateway::{verify_network, GuardedGateway, LedgerEvents, LedgerGateway, LinkHealth};
use crate::projector::LedgerProjector;
use crate::registry::ParticipantRegistry;
use crate::store::ProductStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub account: Address,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub chain_id: u64,
    pub contract: Address,
    pub account: Option<Address>,
    pub role: Role,
    pub link_halted: bool,
    pub halt_reason: Option<String>,
}

pub struct Session {
    settings: SessionSettings,
    chain_id: u64,
    contract: Address,
    health: Arc<LinkHealth>,
    gateway: Arc<GuardedGateway>,
    registry: Arc<ParticipantRegistry>,
    store: Arc<ProductStore>,
    projector: Arc<LedgerProjector>,
    dispatcher: Arc<ActionDispatcher>,
    identity: RwLock<Option<Identity>>,
}

impl Session {
    /// Verify the network, resolve the deployment and wire the components.
    pub async fn connect(
        gateway: Arc<dyn LedgerGateway>,
        artifact: &ContractArtifact,
        settings: SessionSettings,
    ) -> Result<Self> {
        let health = Arc::new(LinkHealth::default());
        let guarded = Arc::new(GuardedGateway::new(gateway, health.clone()));

        let chain_id = verify_network(guarded.as_ref(), settings.expected_chain_id).await?;
        let contract = artifact.deployment(chain_id)?.address.clone();

        let shared: Arc<dyn LedgerGateway> = guarded.clone();
        let registry = Arc::new(ParticipantRegistry::new(shared.clone()));
        let store = Arc::new(ProductStore::new(shared.clone()));
        let projector = Arc::new(LedgerProjector::new(
            Arc::new(LedgerEvents(shared.clone())),
            registry.clone(),
        ));
        let dispatcher = Arc::new(ActionDispatcher::new(
            shared,
            registry.clone(),
            store.clone(),
            settings.clone(),
        ));

        info!("Session connected to chain {chain_id}, contract {contract}");
        Ok(Self {
            settings,
            chain_id,
            contract,
            health,
            gateway: guarded,
            registry,
            store,
            projector,
            dispatcher,
            identity: RwLock::new(None),
        })
    }

    /// Act as `account` from now on. Returns the freshly resolved role.
    pub async fn switch_account(&self, account: Address) -> Result<Role> {
        self.registry.reset().await;
        self.store.clear().await;
        let role = self.registry.resolve_role(&account).await?;
        info!("Account switched to {} ({role})", account.short());
        *self.identity.write().await = Some(Identity { account, role });
        Ok(role)
    }

    pub async fn disconnect(&self) {
        if let Some(previous) = self.identity.write().await.take() {
            info!("Account {} disconnected", previous.account.short());
        }
    }

    /// Re-verify the network and clear a halted link.
    pub async fn reconnect(&self) -> Result<u64> {
        let chain = self.gateway.reconnect(self.settings.expected_chain_id).await?;
        self.registry.reset().await;
        self.store.clear().await;

        let mut identity = self.identity.write().await;
        if let Some(current) = identity.as_mut() {
            current.role = self.registry.resolve_role(&current.account).await?;
        }
        Ok(chain)
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.identity.read().await.clone()
    }

    /// Role of the acting account; `Guest` when none is connected.
    pub async fn role(&self) -> Role {
        self.identity
            .read()
            .await
            .as_ref()
            .map_or(Role::Guest, |identity| identity.role)
    }

    pub async fn info(&self) -> SessionInfo {
        let identity = self.identity().await;
        SessionInfo {
            chain_id: self.chain_id,
            contract: self.contract.clone(),
            account: identity.as_ref().map(|i| i.account.clone()),
            role: identity.map_or(Role::Guest, |i| i.role),
            link_halted: self.health.is_halted(),
            halt_reason: self.health.reason(),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn contract(&self) -> &Address {
        &self.contract
    }

    pub fn explorer_url(&self, tx_hash: &str) -> String {
        explorer_tx_url(self.chain_id, tx_hash)
    }

    pub fn health(&self) -> &Arc<LinkHealth> {
        &self.health
    }

    pub fn gateway(&self) -> Arc<dyn LedgerGateway> {
        self.gateway.clone()
    }

    pub fn registry(&self) -> &Arc<ParticipantRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<ProductStore> {
        &self.store
    }

    pub fn projector(&self) -> &Arc<LedgerProjector> {
        &self.projector
    }

    pub fn dispatcher(&self) -> &Arc<ActionDispatcher> {
        &self.dispatcher
    }
}
