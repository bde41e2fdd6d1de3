//! Full engine tests: startup refresh, merging, diffs and queries

use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use watchpost::{EngineHandle, EntityKind, Event, HostState, ReadyState, Resource};

use crate::helpers::*;

async fn next_snapshot_change(
    rx: &mut tokio::sync::broadcast::Receiver<Event>,
    resource: Resource,
) -> Event {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for snapshot change")
            .expect("event channel closed");

        if matches!(&event, Event::SnapshotChanged { resource: r, .. } if *r == resource) {
            return event;
        }
    }
}

#[tokio::test]
async fn startup_refresh_fills_snapshot() {
    let server = mock_backend().await;

    Mock::given(method("GET"))
        .and(path("/host"))
        .respond_with(ResponseTemplate::new(200).set_body_json(items_page(vec![
            host_item("h1", "web-1", "UP", false, false),
            host_item("h2", "db-1", "DOWN", false, false),
        ])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/service"))
        .respond_with(ResponseTemplate::new(200).set_body_json(items_page(vec![
            service_item("s1", "https", "h1", "OK"),
            service_item("s2", "mysql", "h2", "CRITICAL"),
        ])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/alignakdaemon"))
        .respond_with(ResponseTemplate::new(200).set_body_json(items_page(vec![
            daemon_item("poller-master", "poller", true),
            daemon_item("broker-master", "broker", true),
        ])))
        .mount(&server)
        .await;

    let engine = EngineHandle::spawn(test_config(&server));
    engine.wait_ready(Duration::from_secs(5)).await.unwrap();

    let store = engine.store();
    assert_eq!(store.ready_state().await, ReadyState::Ready);

    let counters = store.counters().await;
    assert_eq!(counters.hosts.up, 1);
    assert_eq!(counters.hosts.down, 1);
    assert_eq!(counters.services.ok, 1);
    assert_eq!(counters.services.critical, 1);
    // db-1 down and mysql critical, nothing acknowledged
    assert_eq!(counters.problems, 2);

    let host = store.get(EntityKind::Host, "h1").await.unwrap();
    assert_eq!(host.name, "web-1");
    assert_eq!(host.state, watchpost::EntityState::Host(HostState::Up));

    assert_eq!(store.get_all(EntityKind::Daemon).await.len(), 2);
    assert_eq!(store.get_all(EntityKind::User).await.len(), 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn state_transition_produces_diff_and_counter_update() {
    let server = mock_backend().await;

    // First poll sees the host up, every later one sees it down
    Mock::given(method("GET"))
        .and(path("/host"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(items_page(vec![host_item("h1", "web-1", "UP", false, false)])),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/host"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(items_page(vec![host_item("h1", "web-1", "DOWN", false, false)])),
        )
        .with_priority(10)
        .mount(&server)
        .await;

    let engine = EngineHandle::spawn(test_config(&server));
    engine.wait_ready(Duration::from_secs(5)).await.unwrap();

    let before = engine.store().counters().await;
    assert_eq!((before.hosts.up, before.hosts.down), (1, 0));

    let mut events = engine.subscribe();
    engine.refresh_now(Some(Resource::Hosts)).await.unwrap();

    let event = next_snapshot_change(&mut events, Resource::Hosts).await;
    let Event::SnapshotChanged { diff, counters, .. } = event else {
        unreachable!()
    };

    assert!(diff.added.is_empty());
    assert!(diff.removed.is_empty());
    assert_eq!(diff.changed.len(), 1);
    assert_eq!(diff.changed[0].id, "h1");
    assert_eq!((counters.hosts.up, counters.hosts.down), (0, 1));
    assert_eq!(counters.problems, 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn identical_poll_emits_no_event() {
    let server = mock_backend().await;

    Mock::given(method("GET"))
        .and(path("/host"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(items_page(vec![host_item("h1", "web-1", "UP", false, false)])),
        )
        .mount(&server)
        .await;

    let engine = EngineHandle::spawn(test_config(&server));
    engine.wait_ready(Duration::from_secs(5)).await.unwrap();

    let mut events = engine.subscribe();
    engine.refresh_now(Some(Resource::Hosts)).await.unwrap();
    engine.refresh_now(Some(Resource::Hosts)).await.unwrap();

    // Give any stray event time to arrive
    let result = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
    assert!(result.is_err(), "idempotent merges must not emit events");

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn find_by_looks_into_raw_fields() {
    let server = mock_backend().await;

    let mut item = host_item("h1", "web-1", "UP", false, false);
    item["address"] = json!("192.168.0.10");

    Mock::given(method("GET"))
        .and(path("/host"))
        .respond_with(ResponseTemplate::new(200).set_body_json(items_page(vec![item])))
        .mount(&server)
        .await;

    let engine = EngineHandle::spawn(test_config(&server));
    engine.wait_ready(Duration::from_secs(5)).await.unwrap();

    let store = engine.store();
    let by_name = store.find_by(EntityKind::Host, "name", "web-1").await;
    assert_eq!(by_name.unwrap().id, "h1");

    let by_address = store
        .find_by(EntityKind::Host, "address", "192.168.0.10")
        .await;
    assert_eq!(by_address.unwrap().id, "h1");

    assert!(
        store
            .find_by(EntityKind::Host, "name", "nonexistent")
            .await
            .is_none()
    );

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn backend_synthesis_counters_are_summed() {
    let server = mock_backend().await;

    Mock::given(method("GET"))
        .and(path("/livesynthesis"))
        .respond_with(ResponseTemplate::new(200).set_body_json(items_page(vec![
            json!({
                "hosts_up_soft": 1, "hosts_up_hard": 4,
                "hosts_down_soft": 1, "hosts_down_hard": 0,
                "services_ok_soft": 0, "services_ok_hard": 12,
                "services_critical_soft": 0, "services_critical_hard": 2,
                "hosts_acknowledged": 1, "services_acknowledged": 2
            }),
            json!({
                "hosts_up_soft": 0, "hosts_up_hard": 3,
                "services_ok_soft": 1, "services_ok_hard": 0
            }),
        ])))
        .mount(&server)
        .await;

    let engine = EngineHandle::spawn(test_config(&server));
    engine.wait_ready(Duration::from_secs(5)).await.unwrap();

    let synthesis = engine.store().synthesis().await.unwrap();
    assert_eq!(synthesis.hosts_up, 8);
    assert_eq!(synthesis.hosts_down, 1);
    assert_eq!(synthesis.services_ok, 13);
    assert_eq!(synthesis.services_critical, 2);
    assert_eq!(synthesis.hosts_acknowledged, 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn history_is_not_required_for_readiness() {
    let server = mock_backend().await;

    Mock::given(method("GET"))
        .and(path("/history"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    // 500s on history also poison connectivity, so keep it last: the five
    // required resources are fetched before history in priority order.
    let engine = EngineHandle::spawn(test_config(&server));
    engine.wait_ready(Duration::from_secs(5)).await.unwrap();

    assert_eq!(engine.store().ready_state().await, ReadyState::Ready);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn ready_state_query_through_handle() {
    let server = mock_backend().await;

    let engine = EngineHandle::spawn(test_config(&server));
    engine.wait_ready(Duration::from_secs(5)).await.unwrap();

    assert_matches!(engine.ready_state().await.unwrap(), ReadyState::Ready);

    engine.shutdown().await.unwrap();
}
