//! Audit trail projection.
//!
//! Rebuilds attributed [`TransactionRecord`]s from the raw event log. The
//! projection holds no state of its own: every call replays the requested
//! block range from its [`EventSource`].
//!
//! Attribution never fails a rebuild. An actor whose profile cannot be
//! resolved is recorded as [`UNKNOWN_PARTICIPANT`]; events with an
//! unrecognised name or without a product id are skipped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use agri_lifecycle::{check_progression, Address, ProgressionError, Stage};
use chrono::DateTime;
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::events::{
    EventKind, RawEvent, TrailSummary, TransactionRecord, OWNER_LABEL, UNKNOWN_PARTICIPANT,
};
use crate::gateway::EventSource;
use crate::registry::ParticipantRegistry;

/// A product whose replayed history breaks the stage progression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressionViolation {
    pub product_id: u64,
    pub reason: String,
}

pub struct LedgerProjector {
    source: Arc<dyn EventSource>,
    registry: Arc<ParticipantRegistry>,
}

impl LedgerProjector {
    pub fn new(source: Arc<dyn EventSource>, registry: Arc<ParticipantRegistry>) -> Self {
        Self { source, registry }
    }

    /// Same projection over a different event source.
    pub fn with_source(&self, source: Arc<dyn EventSource>) -> Self {
        Self {
            source,
            registry: self.registry.clone(),
        }
    }

    /// Records for `[from_block, to_block]`, most recent first.
    pub async fn rebuild(&self, from_block: u64, to_block: u64) -> Result<Vec<TransactionRecord>> {
        let mut records = self.rebuild_ascending(from_block, to_block).await?;
        records.reverse();
        Ok(records)
    }

    /// Records for `[from_block, to_block]` in ledger order.
    pub async fn rebuild_ascending(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransactionRecord>> {
        let mut events = self.source.query_events(from_block, to_block).await?;
        events.sort_by_key(RawEvent::ordering_key);

        let mut names: HashMap<Address, String> = HashMap::new();
        let mut records = Vec::with_capacity(events.len());
        for raw in &events {
            if let Some(record) = self.attribute(raw, &mut names).await {
                records.push(record);
            }
        }

        debug!(
            "Projected {} of {} events in blocks {from_block}..={to_block}",
            records.len(),
            events.len()
        );
        Ok(records)
    }

    /// Whole trail from genesis, most recent first.
    pub async fn rebuild_all(&self) -> Result<Vec<TransactionRecord>> {
        let latest = self.source.latest_block().await?;
        self.rebuild(0, latest).await
    }

    /// One product's trail from genesis, most recent first.
    pub async fn history(&self, product_id: u64) -> Result<Vec<TransactionRecord>> {
        let mut records = self.rebuild_all().await?;
        records.retain(|r| r.product_id == product_id);
        Ok(records)
    }

    async fn attribute(
        &self,
        raw: &RawEvent,
        names: &mut HashMap<Address, String>,
    ) -> Option<TransactionRecord> {
        let Some(kind) = EventKind::from_name(&raw.name) else {
            warn!(
                "Skipping unrecognised event {:?} at block {}",
                raw.name, raw.block_height
            );
            return None;
        };
        let Some(product_id) = raw.product_id() else {
            warn!(
                "Skipping {} without a product id at block {}",
                kind.as_str(),
                raw.block_height
            );
            return None;
        };

        // The event kind fixes the actor's role; only the name is looked up.
        let actor = raw.address_arg(kind.actor_field());
        let participant_name = match (&actor, kind) {
            (_, EventKind::ProductRegistered) => OWNER_LABEL.to_string(),
            (None, _) => {
                warn!("{} for product {product_id} names no actor", kind.as_str());
                UNKNOWN_PARTICIPANT.to_string()
            }
            (Some(address), _) => self.resolve(address, names).await,
        };

        Some(TransactionRecord {
            event_kind: kind,
            product_id,
            actor,
            participant_role: kind.actor_role(),
            participant_name,
            block_height: raw.block_height,
            log_index: raw.log_index,
            tx_hash: raw.tx_hash.clone(),
            timestamp: raw.timestamp.and_then(|t| DateTime::from_timestamp(t, 0)),
        })
    }

    async fn resolve(
        &self,
        address: &Address,
        names: &mut HashMap<Address, String>,
    ) -> String {
        if let Some(hit) = names.get(address) {
            return hit.clone();
        }
        let resolved = match self.registry.resolve_profile(address).await {
            Ok(profile) => profile.name,
            Err(e) => {
                debug!("No profile for {address}: {e}");
                UNKNOWN_PARTICIPANT.to_string()
            }
        };
        names.insert(address.clone(), resolved.clone());
        resolved
    }
}

/// Check each product's replayed stages for gaps and regressions.
///
/// `records` may be in either order. With `from_genesis` unset a product's
/// history may begin after registration.
pub fn verify_progression(
    records: &[TransactionRecord],
    from_genesis: bool,
) -> Vec<ProgressionViolation> {
    let mut ordered: Vec<&TransactionRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.ordering_key());

    let mut per_product: BTreeMap<u64, Vec<Stage>> = BTreeMap::new();
    for record in ordered {
        per_product
            .entry(record.product_id)
            .or_default()
            .push(record.event_kind.stage());
    }

    per_product
        .into_iter()
        .filter_map(|(product_id, stages)| {
            check_progression(&stages, from_genesis)
                .err()
                .map(|e: ProgressionError| ProgressionViolation {
                    product_id,
                    reason: e.to_string(),
                })
        })
        .collect()
}

pub fn summarize(records: &[TransactionRecord]) -> TrailSummary {
    let latest = records.iter().max_by_key(|r| r.ordering_key());
    TrailSummary {
        total: records.len(),
        products: records
            .iter()
            .map(|r| r.product_id)
            .collect::<BTreeSet<_>>()
            .len(),
        latest_block: latest.map(|r| r.block_height),
        latest_event: latest.map(|r| r.event_kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use agri_lifecycle::Role;
    use serde_json::{json, Map, Value};

    use crate::gateway::memory::MemoryLedger;
    use crate::gateway::{LedgerEvents, LedgerGateway};

    fn owner() -> Address {
        Address::from_low_u64(0x0a)
    }

    fn farmer() -> Address {
        Address::from_low_u64(0x01)
    }

    async fn fixture() -> (Arc<MemoryLedger>, LedgerProjector) {
        let ledger = Arc::new(MemoryLedger::new(1337, owner()));
        ledger
            .send("addFarmer", &[json!(farmer().as_str()), json!("Asha"), json!("Nashik")], &owner())
            .await
            .unwrap();
        ledger
            .send("addProduct", &[json!("Rice"), json!("Basmati")], &owner())
            .await
            .unwrap();
        ledger
            .send("plantProduct", &[json!(1)], &farmer())
            .await
            .unwrap();
        ledger
            .send("harvestProduct", &[json!(1)], &farmer())
            .await
            .unwrap();

        let gateway: Arc<dyn LedgerGateway> = ledger.clone();
        let registry = Arc::new(ParticipantRegistry::new(gateway.clone()));
        let projector = LedgerProjector::new(Arc::new(LedgerEvents(gateway)), registry);
        (ledger, projector)
    }

    fn raw(name: &str, args: Value, block_height: u64) -> RawEvent {
        let args: Map<String, Value> = serde_json::from_value(args).unwrap();
        RawEvent {
            name: name.to_string(),
            args,
            block_height,
            log_index: 0,
            tx_hash: format!("0x{block_height:064x}"),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn records_are_attributed_and_newest_first() {
        let (_, projector) = fixture().await;
        let records = projector.rebuild(0, 100).await.unwrap();
        let kinds: Vec<EventKind> = records.iter().map(|r| r.event_kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::ProductHarvested,
                EventKind::ProductPlanted,
                EventKind::ProductRegistered
            ]
        );
        assert_eq!(records[0].participant_name, "Asha");
        assert_eq!(records[0].participant_role, Role::Farmer);
        assert_eq!(records[2].participant_name, OWNER_LABEL);
        assert!(records[0].timestamp.is_some());
    }

    #[tokio::test]
    async fn unknown_participant_does_not_abort_rebuild() {
        let (ledger, projector) = fixture().await;
        let stranger = Address::from_low_u64(0xdead);
        ledger.inject_event(raw(
            "ProductProcessed",
            json!({ "id": 1, "processor": stranger.as_str() }),
            10,
        ));

        let records = projector.rebuild(0, 100).await.unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].event_kind, EventKind::ProductProcessed);
        assert_eq!(records[0].participant_name, UNKNOWN_PARTICIPANT);
        assert_eq!(records[0].actor, Some(stranger));
        assert_eq!(records[1].participant_name, "Asha");
        assert_eq!(records[2].participant_name, "Asha");
    }

    #[tokio::test]
    async fn malformed_events_are_skipped() {
        let (ledger, projector) = fixture().await;
        ledger.inject_event(raw("OwnershipTransferred", json!({ "id": 1 }), 11));
        ledger.inject_event(raw("ProductPlanted", json!({ "farmer": farmer().as_str() }), 12));
        ledger.inject_event(raw("ProductProcessed", json!({ "id": 1 }), 13));

        let records = projector.rebuild_ascending(0, 100).await.unwrap();
        assert_eq!(records.len(), 4);
        let last = records.last().unwrap();
        assert_eq!(last.event_kind, EventKind::ProductProcessed);
        assert_eq!(last.actor, None);
        assert_eq!(last.participant_name, UNKNOWN_PARTICIPANT);
    }

    #[tokio::test]
    async fn rebuild_is_deterministic() {
        let (_, projector) = fixture().await;
        let first = projector.rebuild(0, 100).await.unwrap();
        let second = projector.rebuild(0, 100).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn history_and_summary() {
        let (ledger, projector) = fixture().await;
        ledger
            .send("addProduct", &[json!("Tea"), json!("Assam")], &owner())
            .await
            .unwrap();

        let history = projector.history(1).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|r| r.product_id == 1));

        let all = projector.rebuild_all().await.unwrap();
        let summary = summarize(&all);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.products, 2);
        assert_eq!(summary.latest_event, Some(EventKind::ProductRegistered));
        assert_eq!(summary.latest_block, Some(ledger.latest_block().await.unwrap()));
    }

    #[tokio::test]
    async fn progression_checks() {
        let (ledger, projector) = fixture().await;
        let records = projector.rebuild(0, 100).await.unwrap();
        assert!(verify_progression(&records, true).is_empty());

        // Planted/Harvested only, as seen from a range starting after registration.
        let tail: Vec<TransactionRecord> = records
            .iter()
            .filter(|r| r.event_kind != EventKind::ProductRegistered)
            .cloned()
            .collect();
        assert!(verify_progression(&tail, false).is_empty());
        assert_eq!(verify_progression(&tail, true).len(), 1);

        ledger.inject_event(raw(
            "ProductSold",
            json!({ "id": 1, "retailer": Address::from_low_u64(4).as_str() }),
            20,
        ));
        let records = projector.rebuild(0, 100).await.unwrap();
        let violations = verify_progression(&records, true);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].product_id, 1);
    }
}
