//! Deployment artifact of the supply-chain contract.
//!
//! The artifact is the JSON file the contract toolchain writes on deployment:
//!
//! ```json
//! { "contractName": "AgriSupplyChain", "abi": [], "networks": { "1337": { "address": "0x…" } } }
//! ```

use std::collections::HashMap;
use std::path::Path;

use agri_lifecycle::Address;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::errors::{Result, TrackerError};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractArtifact {
    #[serde(default)]
    pub contract_name: String,
    #[serde(default)]
    pub abi: Vec<Value>,
    /// Keyed by chain id in decimal.
    #[serde(default)]
    pub networks: HashMap<String, Deployment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Deployment {
    pub address: Address,
}

impl ContractArtifact {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            TrackerError::Config(format!("cannot read artifact {}: {e}", path.display()))
        })?;
        let artifact = Self::from_json(&raw)?;
        info!(
            "Loaded artifact {} ({} networks)",
            artifact.contract_name,
            artifact.networks.len()
        );
        Ok(artifact)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Deployment on `chain_id`. Absence is fatal for the session.
    pub fn deployment(&self, chain_id: u64) -> Result<&Deployment> {
        self.networks
            .get(&chain_id.to_string())
            .ok_or(TrackerError::NotDeployed(chain_id))
    }

    /// Artifact with a single deployment, for wiring an in-process ledger.
    pub fn single(contract_name: &str, chain_id: u64, address: Address) -> Self {
        Self {
            contract_name: contract_name.to_string(),
            abi: Vec::new(),
            networks: HashMap::from([(chain_id.to_string(), Deployment { address })]),
        }
    }
}
