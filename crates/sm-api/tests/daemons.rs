//! Billing daemon and idle reaper tick semantics over the in-memory store.
//!
//! Time never passes for real here: lifecycle timestamps are backdated
//! through the storage port and a single tick is driven directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use sm_api::service::ServerService;
use sm_api::{billing, reaper};
use sm_db::models::{EventType, ServerAction, ServerState, Stamp};
use sm_db::{MemStore, Store};

async fn setup(pool: &[&str]) -> (Arc<MemStore>, Arc<ServerService>) {
    let store = Arc::new(MemStore::new());
    let addresses: Vec<String> = pool.iter().map(|a| a.to_string()).collect();
    store.insert_ips(&addresses).await.expect("seed pool");
    let service = Arc::new(ServerService::new(store.clone() as Arc<dyn Store>));
    (store, service)
}

async fn provision(service: &ServerService) -> Uuid {
    service.provision("r1", "t2.micro").await.expect("provision")
}

/// Push `started_at` into the past without touching anything else the FSM
/// would normally stamp.
async fn backdate_start(store: &dyn Store, id: Uuid, seconds: i64) {
    let past = Utc::now() - chrono::Duration::seconds(seconds);
    store
        .update_server_state(id, ServerState::Running, Stamp::Started, past)
        .await
        .expect("backdate start");
}

#[tokio::test]
async fn billing_charges_running_servers() {
    let (store, service) = setup(&["10.0.0.1"]).await;
    let id = provision(&service).await;
    backdate_start(store.as_ref(), id, 3).await;

    // $3.60/hour is $0.001/second.
    let billed = billing::run_tick(store.as_ref(), 3.60).await;
    assert_eq!(billed, 1);

    let detail = store.get_server(id).await.unwrap().unwrap();
    let meter = detail.billing.unwrap();
    assert!(
        (3..=4).contains(&meter.accumulated_seconds),
        "accumulated {}",
        meter.accumulated_seconds
    );
    assert!(meter.total_cost >= 0.003 && meter.total_cost < 0.005, "cost {}", meter.total_cost);
    assert!(meter.last_billed_at.is_some());
}

#[tokio::test]
async fn billing_does_not_double_count_across_ticks() {
    let (store, service) = setup(&["10.0.0.1"]).await;
    let id = provision(&service).await;
    backdate_start(store.as_ref(), id, 10).await;

    billing::run_tick(store.as_ref(), 3.60).await;
    let first = store
        .get_server(id)
        .await
        .unwrap()
        .unwrap()
        .billing
        .unwrap();

    // An immediate second tick meters from last_billed_at: a sub-second
    // interval adds nothing, and nothing ever decreases.
    billing::run_tick(store.as_ref(), 3.60).await;
    let second = store
        .get_server(id)
        .await
        .unwrap()
        .unwrap()
        .billing
        .unwrap();

    assert!(second.accumulated_seconds >= first.accumulated_seconds);
    assert!(second.total_cost >= first.total_cost);
    assert!(
        second.accumulated_seconds <= first.accumulated_seconds + 1,
        "second tick re-billed uptime: {} -> {}",
        first.accumulated_seconds,
        second.accumulated_seconds
    );
}

#[tokio::test]
async fn billing_skips_stopped_servers() {
    let (store, service) = setup(&["10.0.0.1"]).await;
    let id = provision(&service).await;
    backdate_start(store.as_ref(), id, 60).await;
    service.action(id, ServerAction::Stop).await.expect("stop");

    let billed = billing::run_tick(store.as_ref(), 3.60).await;
    assert_eq!(billed, 0);

    let meter = store
        .get_server(id)
        .await
        .unwrap()
        .unwrap()
        .billing
        .unwrap();
    assert_eq!(meter.accumulated_seconds, 0);
}

#[tokio::test]
async fn reboot_preserves_uptime_metering() {
    let (store, service) = setup(&["10.0.0.1"]).await;
    let id = provision(&service).await;
    backdate_start(store.as_ref(), id, 2).await;

    service.action(id, ServerAction::Reboot).await.expect("reboot");

    let detail = store.get_server(id).await.unwrap().unwrap();
    assert_eq!(detail.server.state, ServerState::Running);

    // started_at survived the reboot, so the meter still sees the uptime
    // accrued before it.
    billing::run_tick(store.as_ref(), 3.60).await;
    let meter = store
        .get_server(id)
        .await
        .unwrap()
        .unwrap()
        .billing
        .unwrap();
    assert!(meter.accumulated_seconds >= 2, "accumulated {}", meter.accumulated_seconds);
}

#[tokio::test]
async fn reaper_terminates_long_stopped_servers() {
    let (store, service) = setup(&["10.0.0.1"]).await;
    let id = provision(&service).await;
    service.action(id, ServerAction::Stop).await.expect("stop");

    // Simulate the idle timeout having elapsed.
    let past = Utc::now() - chrono::Duration::seconds(31 * 60);
    store
        .update_server_state(id, ServerState::Stopped, Stamp::Stopped, past)
        .await
        .expect("backdate stop");

    let reaped = reaper::run_tick(store.as_ref(), service.as_ref(), Duration::from_secs(30 * 60)).await;
    assert_eq!(reaped, 1);

    let detail = store.get_server(id).await.unwrap().unwrap();
    assert_eq!(detail.server.state, ServerState::Terminated);
    assert!(detail.server.terminated_at.is_some());
    assert!(detail.server.ip_id.is_none());
    assert!(detail.ip.is_none());

    let kinds: Vec<EventType> = detail.events.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&EventType::Reaped), "journal: {kinds:?}");
    assert!(kinds.contains(&EventType::Terminated));

    // The address went back to the pool.
    let (_, free) = store.count_ips().await.unwrap();
    assert_eq!(free, 1);
}

#[tokio::test]
async fn reaper_leaves_recently_stopped_servers_alone() {
    let (store, service) = setup(&["10.0.0.1"]).await;
    let id = provision(&service).await;
    service.action(id, ServerAction::Stop).await.expect("stop");

    let reaped = reaper::run_tick(store.as_ref(), service.as_ref(), Duration::from_secs(30 * 60)).await;
    assert_eq!(reaped, 0);

    let detail = store.get_server(id).await.unwrap().unwrap();
    assert_eq!(detail.server.state, ServerState::Stopped);
}

#[tokio::test]
async fn reaper_respects_a_restart_between_listing_and_locking() {
    let (store, service) = setup(&["10.0.0.1"]).await;
    let id = provision(&service).await;
    service.action(id, ServerAction::Stop).await.expect("stop");

    let past = Utc::now() - chrono::Duration::seconds(31 * 60);
    store
        .update_server_state(id, ServerState::Stopped, Stamp::Stopped, past)
        .await
        .expect("backdate stop");

    // The server comes back before the reaper gets to it: the re-check under
    // the server lock must leave it running.
    service.action(id, ServerAction::Start).await.expect("start");
    let cutoff = Utc::now() - chrono::Duration::seconds(30 * 60);
    let reaped = service.reap_if_idle(id, cutoff).await.expect("reap check");
    assert!(!reaped);

    let detail = store.get_server(id).await.unwrap().unwrap();
    assert_eq!(detail.server.state, ServerState::Running);
}

#[tokio::test]
async fn terminated_servers_keep_their_meter_but_stop_accruing() {
    let (store, service) = setup(&["10.0.0.1"]).await;
    let id = provision(&service).await;
    backdate_start(store.as_ref(), id, 5).await;

    billing::run_tick(store.as_ref(), 3.60).await;
    let before = store
        .get_server(id)
        .await
        .unwrap()
        .unwrap()
        .billing
        .unwrap();
    assert!(before.accumulated_seconds >= 5);

    service
        .action(id, ServerAction::Terminate)
        .await
        .expect("terminate");

    billing::run_tick(store.as_ref(), 3.60).await;
    let after = store
        .get_server(id)
        .await
        .unwrap()
        .unwrap()
        .billing
        .unwrap();
    assert_eq!(after.accumulated_seconds, before.accumulated_seconds);
    assert_eq!(after.total_cost, before.total_cost);
}
