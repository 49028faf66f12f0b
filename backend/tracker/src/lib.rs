//! Agricultural supply-chain tracker.
//!
//! Client side of the supply-chain contract: resolves participants, reads
//! products, dispatches custody transitions under a caller identity and
//! rebuilds the attributed audit trail from the ledger's event log. A
//! background indexer mirrors that log into SQLite and a small Axum API
//! exposes everything over HTTP.

pub mod api;
pub mod artifact;
pub mod config;
pub mod contract;
pub mod db;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod indexer;
pub mod projector;
pub mod registry;
pub mod session;
pub mod store;

#[cfg(test)]
mod test_scenarios;
