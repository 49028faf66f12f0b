//! End-to-end scenarios: a full session against the in-process ledger.

use std::sync::Arc;
use std::time::Duration;

use agri_lifecycle::{check_advance, check_custody, Action, Address, Role, Stage};
use serde_json::{json, Map, Value};

use crate::artifact::ContractArtifact;
use crate::config::SessionSettings;
use crate::dispatcher::DispatchState;
use crate::errors::TrackerError;
use crate::events::{EventKind, RawEvent, UNKNOWN_PARTICIPANT};
use crate::gateway::memory::MemoryLedger;
use crate::gateway::LedgerGateway;
use crate::projector::verify_progression;
use crate::session::Session;

fn owner() -> Address {
    Address::from_low_u64(0x0a)
}

fn farmer() -> Address {
    Address::from_low_u64(0x01)
}

fn processor() -> Address {
    Address::from_low_u64(0x02)
}

fn distributor() -> Address {
    Address::from_low_u64(0x03)
}

fn retailer() -> Address {
    Address::from_low_u64(0x04)
}

fn settings() -> SessionSettings {
    SessionSettings {
        confirm_delay: Duration::from_millis(1),
        ..SessionSettings::default()
    }
}

async fn connect(ledger: Arc<MemoryLedger>, settings: SessionSettings) -> Arc<Session> {
    let artifact = ContractArtifact::single("AgriSupplyChain", 1337, Address::from_low_u64(0xc0));
    Arc::new(Session::connect(ledger, &artifact, settings).await.unwrap())
}

/// Ledger with one participant per role and product 1 at `Registered`.
async fn world(settings: SessionSettings) -> (Arc<MemoryLedger>, Arc<Session>) {
    let ledger = Arc::new(MemoryLedger::new(1337, owner()));
    let session = connect(ledger.clone(), settings).await;
    let registry = session.registry();
    for (address, role, name) in [
        (farmer(), Role::Farmer, "Asha"),
        (processor(), Role::Processor, "Deccan Mills"),
        (distributor(), Role::Distributor, "Konkan Freight"),
        (retailer(), Role::Retailer, "Corner Shop"),
    ] {
        registry
            .register(&owner(), &address, role, name, "Maharashtra")
            .await
            .unwrap();
    }
    session
        .dispatcher()
        .register_product(&owner(), "Rice", "Basmati, 25 kg")
        .await
        .unwrap();
    (ledger, session)
}

const LIFECYCLE: [(Action, fn() -> Address); 6] = [
    (Action::Plant, farmer),
    (Action::Harvest, farmer),
    (Action::Process, processor),
    (Action::Distribute, distributor),
    (Action::Receive, retailer),
    (Action::Sell, retailer),
];

#[tokio::test]
async fn farmer_plants_registered_product() {
    let (_, session) = world(settings()).await;
    let confirmation = session
        .dispatcher()
        .dispatch(1, Action::Plant, &farmer())
        .await
        .unwrap();
    assert_eq!(confirmation.stage, Stage::Planted);
    assert!(confirmation.caught_up);

    let product = session.store().get(1).await.unwrap();
    assert_eq!(product.stage, Stage::Planted);
    assert_eq!(product.farmer, Some(farmer()));
}

#[tokio::test]
async fn processor_cannot_plant_and_ledger_is_not_contacted() {
    let (ledger, session) = world(settings()).await;
    let sent = ledger.submission_count();
    let err = session
        .dispatcher()
        .dispatch(1, Action::Plant, &processor())
        .await
        .unwrap_err();
    assert!(matches!(err, TrackerError::Unauthorized(_)), "{err}");
    assert_eq!(ledger.submission_count(), sent);
}

#[tokio::test]
async fn full_lifecycle_then_terminal() {
    let (ledger, session) = world(settings()).await;
    let dispatcher = session.dispatcher();

    let mut seen = vec![Stage::Registered];
    for (action, who) in LIFECYCLE {
        let confirmation = dispatcher.dispatch(1, action, &who()).await.unwrap();
        assert_eq!(confirmation.stage, action.result());
        seen.push(confirmation.stage);
    }
    for pair in seen.windows(2) {
        check_advance(pair[0], pair[1]).unwrap();
    }

    let product = session.store().fetch(1).await.unwrap();
    assert_eq!(product.stage, Stage::Sold);
    check_custody(&product).unwrap();

    let sent = ledger.submission_count();
    for action in [Action::Sell, Action::Plant, Action::Receive, Action::Register] {
        let err = dispatcher.dispatch(1, action, &retailer()).await.unwrap_err();
        assert!(matches!(err, TrackerError::TerminalState(_)), "{err}");
    }
    assert_eq!(ledger.submission_count(), sent);

    let records = session.projector().rebuild_all().await.unwrap();
    let kinds: Vec<EventKind> = records.iter().rev().map(|r| r.event_kind).collect();
    assert_eq!(kinds, EventKind::ALL.to_vec());
    assert!(verify_progression(&records, true).is_empty());
    assert_eq!(records[0].participant_name, "Corner Shop");
    assert_eq!(records[3].participant_name, "Deccan Mills");
}

#[tokio::test]
async fn second_dispatch_while_submitting_is_refused() {
    let (ledger, session) = world(settings()).await;
    ledger.pause_submissions();
    let sent = ledger.submission_count();

    let first = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .dispatcher()
                .dispatch(1, Action::Plant, &farmer())
                .await
        })
    };

    // Wait until the first call is held at the ledger.
    tokio::time::timeout(Duration::from_secs(5), async {
        while ledger.submission_count() == sent {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        session.dispatcher().state(1, &farmer()),
        DispatchState::Submitting
    );

    let err = session
        .dispatcher()
        .dispatch(1, Action::Plant, &farmer())
        .await
        .unwrap_err();
    assert!(matches!(err, TrackerError::AlreadyInProgress { product_id: 1, .. }), "{err}");
    assert_eq!(ledger.submission_count(), sent + 1);

    ledger.resume_submissions();
    let confirmation = first.await.unwrap().unwrap();
    assert_eq!(confirmation.stage, Stage::Planted);
    assert_eq!(
        session.dispatcher().state(1, &farmer()),
        DispatchState::Confirmed
    );
}

#[tokio::test]
async fn late_acknowledgment_is_unknown_and_reconciled() {
    let (ledger, session) = world(SessionSettings {
        submit_timeout: Duration::from_millis(50),
        ..settings()
    })
    .await;
    ledger.set_ack_delay(Duration::from_millis(500));

    let err = session
        .dispatcher()
        .dispatch(1, Action::Plant, &farmer())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            TrackerError::Unknown {
                product_id: 1,
                observed: Some(Stage::Planted)
            }
        ),
        "{err}"
    );
    assert_eq!(
        session.dispatcher().state(1, &farmer()),
        DispatchState::Unknown
    );
    assert_eq!(session.store().cached_stage(1).await, Some(Stage::Planted));
}

#[tokio::test]
async fn ledger_rejection_overrides_stale_precheck() {
    let (ledger, session) = world(settings()).await;
    // The store has seen Registered; plant behind its back.
    assert_eq!(session.store().refresh_stage(1).await.unwrap(), Stage::Registered);
    ledger
        .send("plantProduct", &[json!(1)], &farmer())
        .await
        .unwrap();

    let err = session
        .dispatcher()
        .dispatch(1, Action::Plant, &farmer())
        .await
        .unwrap_err();
    match err {
        TrackerError::Rejected(reason) => {
            assert_eq!(reason, "cannot plant a product at stage Planted (requires Registered)");
        }
        other => panic!("expected ledger rejection, got {other}"),
    }
    assert_eq!(session.store().cached_stage(1).await, Some(Stage::Planted));
    assert_eq!(
        session.dispatcher().state(1, &farmer()),
        DispatchState::Rejected
    );
}

#[tokio::test]
async fn stale_cached_stage_is_refreshed_before_refusing() {
    let (ledger, session) = world(settings()).await;
    // The store has seen Registered; plant behind its back.
    assert_eq!(session.store().refresh_stage(1).await.unwrap(), Stage::Registered);
    ledger
        .send("plantProduct", &[json!(1)], &farmer())
        .await
        .unwrap();
    let sent = ledger.submission_count();

    let confirmation = session
        .dispatcher()
        .dispatch(1, Action::Harvest, &farmer())
        .await
        .unwrap();
    assert_eq!(confirmation.stage, Stage::Harvested);
    assert_eq!(ledger.submission_count(), sent + 1);
}

#[tokio::test]
async fn invalidated_product_is_read_again_before_dispatch() {
    let (ledger, session) = world(settings()).await;
    assert_eq!(session.store().refresh_stage(1).await.unwrap(), Stage::Registered);
    ledger
        .send("plantProduct", &[json!(1)], &farmer())
        .await
        .unwrap();
    session.store().invalidate(1).await;
    assert_eq!(session.store().cached_stage(1).await, None);

    let confirmation = session
        .dispatcher()
        .dispatch(1, Action::Harvest, &farmer())
        .await
        .unwrap();
    assert_eq!(confirmation.stage, Stage::Harvested);
}

#[tokio::test]
async fn dispatch_abandoned_after_send_is_unknown() {
    let (ledger, session) = world(settings()).await;
    ledger.pause_submissions();
    let sent = ledger.submission_count();

    let first = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .dispatcher()
                .dispatch(1, Action::Plant, &farmer())
                .await
        })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while ledger.submission_count() == sent {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();

    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());
    assert_eq!(
        session.dispatcher().state(1, &farmer()),
        DispatchState::Unknown
    );
    ledger.resume_submissions();
}

#[tokio::test]
async fn refresh_stage_twice_is_stable() {
    let (_, session) = world(settings()).await;
    session
        .dispatcher()
        .dispatch(1, Action::Plant, &farmer())
        .await
        .unwrap();
    let a = session.store().refresh_stage(1).await.unwrap();
    let b = session.store().refresh_stage(1).await.unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn rebuild_twice_is_identical() {
    let (_, session) = world(settings()).await;
    for (action, who) in &LIFECYCLE[..3] {
        session
            .dispatcher()
            .dispatch(1, *action, &who())
            .await
            .unwrap();
    }
    let latest = session.gateway().latest_block().await.unwrap();
    let first = session.projector().rebuild(0, latest).await.unwrap();
    let second = session.projector().rebuild(0, latest).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 4);
}

#[tokio::test]
async fn unregistered_processor_is_attributed_as_unknown() {
    let (ledger, session) = world(settings()).await;
    for (action, who) in &LIFECYCLE[..2] {
        session
            .dispatcher()
            .dispatch(1, *action, &who())
            .await
            .unwrap();
    }

    let latest = session.gateway().latest_block().await.unwrap();
    let mut args = Map::new();
    args.insert("id".to_string(), json!(1));
    args.insert(
        "processor".to_string(),
        Value::String(Address::from_low_u64(0xbad).as_str().to_string()),
    );
    ledger.inject_event(RawEvent {
        name: "ProductProcessed".to_string(),
        args,
        block_height: latest + 1,
        log_index: 0,
        tx_hash: "0xfeed".to_string(),
        timestamp: None,
    });

    let records = session.projector().rebuild_all().await.unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].event_kind, EventKind::ProductProcessed);
    assert_eq!(records[0].participant_name, UNKNOWN_PARTICIPANT);
    assert_eq!(records[0].participant_role, Role::Processor);
    assert_eq!(records[1].participant_name, "Asha");
    assert_eq!(records[2].participant_name, "Asha");
    assert!(verify_progression(&records, true).is_empty());
}

#[tokio::test]
async fn switching_account_re_resolves_role() {
    let (_, session) = world(settings()).await;
    let newcomer = Address::from_low_u64(0x55);

    assert_eq!(session.switch_account(newcomer.clone()).await.unwrap(), Role::Guest);
    session
        .registry()
        .register(&owner(), &newcomer, Role::Distributor, "Late Freight", "Goa")
        .await
        .unwrap();
    assert_eq!(
        session.switch_account(newcomer.clone()).await.unwrap(),
        Role::Distributor
    );
    assert_eq!(session.role().await, Role::Distributor);

    session.switch_account(owner()).await.unwrap();
    assert_eq!(session.role().await, Role::Owner);
}

#[tokio::test]
async fn outage_halts_until_reconnect() {
    let (ledger, session) = world(settings()).await;
    ledger.set_offline(true);
    let err = session
        .dispatcher()
        .dispatch(1, Action::Plant, &farmer())
        .await
        .unwrap_err();
    assert!(matches!(err, TrackerError::GatewayUnavailable(_)), "{err}");

    ledger.set_offline(false);
    let sent = ledger.submission_count();
    assert!(matches!(
        session.dispatcher().dispatch(1, Action::Plant, &farmer()).await,
        Err(TrackerError::GatewayUnavailable(_))
    ));
    assert_eq!(ledger.submission_count(), sent);

    session.reconnect().await.unwrap();
    let confirmation = session
        .dispatcher()
        .dispatch(1, Action::Plant, &farmer())
        .await
        .unwrap();
    assert_eq!(confirmation.stage, Stage::Planted);
}
