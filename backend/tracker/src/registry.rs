//! Participant registry: role and profile resolution by address.
//!
//! Role lookup is a plain unauthenticated read. The contract owner is not a
//! participant row; it is recognised by address before the role table is
//! consulted. Resolved participants are cached until [`ParticipantRegistry::reset`].
//! Guests are never cached so a later registration is picked up.

use std::collections::HashMap;
use std::sync::Arc;

use agri_lifecycle::{Address, Participant, Profile, Role};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::contract;
use crate::errors::{Result, TrackerError};
use crate::gateway::{LedgerGateway, Submission};

pub struct ParticipantRegistry {
    gateway: Arc<dyn LedgerGateway>,
    owner: RwLock<Option<Address>>,
    roles: RwLock<HashMap<Address, Role>>,
    profiles: RwLock<HashMap<Address, Profile>>,
}

impl ParticipantRegistry {
    pub fn new(gateway: Arc<dyn LedgerGateway>) -> Self {
        Self {
            gateway,
            owner: RwLock::new(None),
            roles: RwLock::new(HashMap::new()),
            profiles: RwLock::new(HashMap::new()),
        }
    }

    /// The contract owner, read once per cache generation.
    pub async fn owner(&self) -> Result<Address> {
        if let Some(owner) = self.owner.read().await.as_ref() {
            return Ok(owner.clone());
        }
        let value = self.gateway.read(contract::OWNER, &[]).await?;
        let owner = contract::decode_address(&value)?
            .ok_or_else(|| TrackerError::EventParse("contract reports no owner".to_string()))?;
        *self.owner.write().await = Some(owner.clone());
        Ok(owner)
    }

    pub async fn resolve_role(&self, address: &Address) -> Result<Role> {
        if *address == self.owner().await? {
            return Ok(Role::Owner);
        }
        if let Some(role) = self.roles.read().await.get(address) {
            return Ok(*role);
        }

        let value = self
            .gateway
            .read(contract::USER_ROLE, &[json!(address.as_str())])
            .await?;
        let raw = value.as_str().unwrap_or_default().trim();
        let role = match raw.parse::<Role>() {
            Ok(role) if role.is_participant() => role,
            Ok(_) => Role::Guest,
            Err(_) if raw.is_empty() => Role::Guest,
            Err(e) => {
                warn!("Unrecognised role for {address}: {e}");
                Role::Guest
            }
        };

        if role.is_participant() {
            self.roles.write().await.insert(address.clone(), role);
        }
        debug!("Resolved {} as {role}", address.short());
        Ok(role)
    }

    pub async fn resolve_profile(&self, address: &Address) -> Result<Profile> {
        if let Some(profile) = self.profiles.read().await.get(address) {
            return Ok(profile.clone());
        }

        let role = self.resolve_role(address).await?;
        let function = contract::profile_function(role)
            .ok_or_else(|| TrackerError::NotFound(format!("participant {address}")))?;
        let value = self
            .gateway
            .read(function, &[json!(address.as_str())])
            .await?;
        let profile = contract::decode_profile(&value)
            .ok_or_else(|| TrackerError::NotFound(format!("participant {address}")))?;

        self.profiles
            .write()
            .await
            .insert(address.clone(), profile.clone());
        Ok(profile)
    }

    pub async fn participant(&self, address: &Address) -> Result<Participant> {
        let profile = self.resolve_profile(address).await?;
        let role = self.resolve_role(address).await?;
        Ok(Participant {
            address: address.clone(),
            role,
            name: profile.name,
            location: profile.location,
        })
    }

    /// Register `address` under `role`. Only the owner may do this, and an
    /// address can hold one role at most.
    pub async fn register(
        &self,
        caller: &Address,
        address: &Address,
        role: Role,
        name: &str,
        location: &str,
    ) -> Result<Participant> {
        let caller_role = self.resolve_role(caller).await?;
        if caller_role != Role::Owner {
            return Err(TrackerError::Unauthorized(format!(
                "only the Owner can register participants, caller is {caller_role}"
            )));
        }
        let function = contract::register_function(role).ok_or_else(|| {
            TrackerError::InvalidInput(format!("cannot register a participant as {role}"))
        })?;
        let name = name.trim();
        if name.is_empty() {
            return Err(TrackerError::InvalidInput(
                "participant name is required".to_string(),
            ));
        }
        if self.resolve_role(address).await? != Role::Guest {
            return Err(TrackerError::DuplicateParticipant(address.clone()));
        }

        let args = [json!(address.as_str()), json!(name), json!(location.trim())];
        match self.gateway.send(function, &args, caller).await? {
            Submission::Accepted { .. } => {}
            Submission::Rejected { reason: Some(reason) } => {
                return Err(TrackerError::Rejected(reason));
            }
            Submission::Rejected { reason: None } => return Err(TrackerError::ActionFailed),
            Submission::Undetermined { detail } => {
                warn!("Registration of {address} unconfirmed: {detail}");
                if self.resolve_role(address).await? != role {
                    return Err(TrackerError::Unconfirmed(format!(
                        "registration of {address}: {detail}"
                    )));
                }
            }
        }

        info!("Registered {address} as {role} ({name})");
        let participant = Participant {
            address: address.clone(),
            role,
            name: name.to_string(),
            location: location.trim().to_string(),
        };
        self.roles.write().await.insert(address.clone(), role);
        self.profiles
            .write()
            .await
            .insert(address.clone(), participant.profile());
        Ok(participant)
    }

    /// Drop every cached resolution.
    pub async fn reset(&self) {
        *self.owner.write().await = None;
        self.roles.write().await.clear();
        self.profiles.write().await.clear();
    }
}
