//! Collection and entity-mirror integration tests
//!
//! Exercise the shared collection cache over an in-memory hub: lazy
//! attach, streamed and legacy entity transports, grace-period detach,
//! and re-fetch after a reconnect.

mod support;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use hearth_client::entities::{entity_collection, get_states, subscribe_entities, EntityMap};
use hearth_client::HearthError;
use support::connect_session;

const WAIT: Duration = Duration::from_secs(5);

async fn next_map(rx: &mut mpsc::UnboundedReceiver<EntityMap>) -> EntityMap {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an entity map")
        .expect("map channel closed")
}

/// Full entity as a legacy hub reports it.
fn kitchen_entity(state: &str) -> Value {
    json!({
        "entity_id": "light.kitchen",
        "state": state,
        "attributes": { "friendly_name": "Kitchen" },
        "context": { "id": "ctx-1", "parent_id": null, "user_id": null },
        "last_changed": "2021-12-01T00:00:00Z",
        "last_updated": "2021-12-01T00:00:00Z",
    })
}

#[tokio::test]
async fn test_streamed_entities_populate_and_update() {
    let (session, _hub, mut socket) = connect_session("2023.1.0").await;
    let (maps_tx, mut maps_rx) = mpsc::unbounded_channel();

    let subscription = tokio::spawn({
        let session = session.clone();
        async move {
            subscribe_entities(&session, move |entities| {
                let _ = maps_tx.send(entities.clone());
            })
            .await
        }
    });

    let frame = socket.expect_type("subscribe_entities").await;
    assert_eq!(frame["id"], 2);
    socket.result_ok(2, Value::Null);
    let subscription = subscription.await.unwrap();

    socket.event(
        2,
        json!({
            "a": {
                "light.kitchen": {
                    "s": "on",
                    "a": { "brightness": 128 },
                    "c": "ctx-1",
                    "lc": 1_600_000_000.0,
                }
            }
        }),
    );
    let map = next_map(&mut maps_rx).await;
    assert_eq!(map.len(), 1);
    assert_eq!(map["light.kitchen"].state, "on");
    assert_eq!(map["light.kitchen"].attributes["brightness"], 128);

    socket.event(
        2,
        json!({
            "c": { "light.kitchen": { "+": { "s": "off", "lu": 1_600_000_100.0 } } }
        }),
    );
    let map = next_map(&mut maps_rx).await;
    assert_eq!(map["light.kitchen"].state, "off");

    subscription.unsubscribe();
}

#[tokio::test(start_paused = true)]
async fn test_second_subscriber_shares_the_wire_subscription() {
    let (session, _hub, mut socket) = connect_session("2023.1.0").await;
    let (first_tx, mut first_rx) = mpsc::unbounded_channel();

    let first = tokio::spawn({
        let session = session.clone();
        async move {
            subscribe_entities(&session, move |entities| {
                let _ = first_tx.send(entities.clone());
            })
            .await
        }
    });
    socket.expect_type("subscribe_entities").await;
    socket.result_ok(2, Value::Null);
    let first = first.await.unwrap();

    socket.event(
        2,
        json!({
            "a": { "light.kitchen": { "s": "on", "a": {}, "c": "ctx-1", "lc": 1.0 } }
        }),
    );
    next_map(&mut first_rx).await;

    // A second subscriber reuses the live subscription and gets the
    // current state delivered asynchronously.
    let collection = entity_collection(&session);
    let (second_tx, mut second_rx) = mpsc::unbounded_channel();
    let second = collection
        .subscribe(move |entities: &EntityMap| {
            let _ = second_tx.send(entities.clone());
        })
        .await;

    let map = next_map(&mut second_rx).await;
    assert_eq!(map.len(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(socket.no_pending_frame());

    second.unsubscribe();
    first.unsubscribe();
}

#[tokio::test(start_paused = true)]
async fn test_last_unsubscribe_detaches_after_grace_period() {
    let (session, _hub, mut socket) = connect_session("2023.1.0").await;
    let collection = entity_collection(&session);

    let subscription = tokio::spawn({
        let session = session.clone();
        async move { subscribe_entities(&session, |_| {}).await }
    });
    socket.expect_type("subscribe_entities").await;
    socket.result_ok(2, Value::Null);
    let subscription = subscription.await.unwrap();

    socket.event(
        2,
        json!({
            "a": { "light.kitchen": { "s": "on", "a": {}, "c": "ctx-1", "lc": 1.0 } }
        }),
    );

    subscription.unsubscribe();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(socket.no_pending_frame());

    // Grace expires: the wire subscription is dropped and state cleared.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let frame = socket.expect_type("unsubscribe_events").await;
    assert_eq!(frame["subscription"], 2);
    socket.result_ok(frame["id"].as_u64().unwrap(), Value::Null);
    assert!(collection.state().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_within_grace_keeps_the_wire_subscription() {
    let (session, _hub, mut socket) = connect_session("2023.1.0").await;
    let collection = entity_collection(&session);

    let subscription = tokio::spawn({
        let session = session.clone();
        async move { subscribe_entities(&session, |_| {}).await }
    });
    socket.expect_type("subscribe_entities").await;
    socket.result_ok(2, Value::Null);
    let subscription = subscription.await.unwrap();

    socket.event(
        2,
        json!({
            "a": { "light.kitchen": { "s": "on", "a": {}, "c": "ctx-1", "lc": 1.0 } }
        }),
    );
    subscription.unsubscribe();
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Coming back within the grace period cancels the detach timer and
    // reuses both the subscription and the cached state.
    let (maps_tx, mut maps_rx) = mpsc::unbounded_channel();
    let revived = collection
        .subscribe(move |entities: &EntityMap| {
            let _ = maps_tx.send(entities.clone());
        })
        .await;
    let map = next_map(&mut maps_rx).await;
    assert_eq!(map.len(), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(socket.no_pending_frame());
    assert!(collection.state().is_some());

    revived.unsubscribe();
}

#[tokio::test]
async fn test_disconnect_during_grace_tears_down_immediately() {
    let (session, mut hub, mut socket) = connect_session("2023.1.0").await;
    let collection = entity_collection(&session);

    let subscription = tokio::spawn({
        let session = session.clone();
        async move { subscribe_entities(&session, |_| {}).await }
    });
    socket.expect_type("subscribe_entities").await;
    socket.result_ok(2, Value::Null);
    let subscription = subscription.await.unwrap();

    socket.event(
        2,
        json!({
            "a": { "light.kitchen": { "s": "on", "a": {}, "c": "ctx-1", "lc": 1.0 } }
        }),
    );
    subscription.unsubscribe();

    // Losing the socket while the grace timer runs skips the wait; the
    // wire subscription died with the socket anyway.
    socket.close();
    let mut socket = hub.next_socket().await;
    socket.auth_handshake("2023.1.0").await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(socket.no_pending_frame());
    assert!(collection.state().is_none());
}

#[tokio::test]
async fn test_legacy_hub_fetches_states_and_follows_events() {
    let (session, _hub, mut socket) = connect_session("2021.12.0").await;
    let (maps_tx, mut maps_rx) = mpsc::unbounded_channel();

    let subscription = tokio::spawn({
        let session = session.clone();
        async move {
            subscribe_entities(&session, move |entities| {
                let _ = maps_tx.send(entities.clone());
            })
            .await
        }
    });

    // Old hubs get the event subscription plus a full fetch.
    let frame = socket.expect_type("subscribe_events").await;
    assert_eq!(frame["id"], 2);
    assert_eq!(frame["event_type"], "state_changed");
    socket.result_ok(2, Value::Null);
    let subscription = subscription.await.unwrap();

    let frame = socket.expect_type("get_states").await;
    assert_eq!(frame["id"], 3);
    socket.result_ok(3, json!([kitchen_entity("on")]));
    let map = next_map(&mut maps_rx).await;
    assert_eq!(map.len(), 1);
    assert_eq!(map["light.kitchen"].state, "on");

    socket.event(
        2,
        json!({
            "event_type": "state_changed",
            "data": { "entity_id": "light.kitchen", "new_state": kitchen_entity("off") },
        }),
    );
    let map = next_map(&mut maps_rx).await;
    assert_eq!(map["light.kitchen"].state, "off");

    // A null new_state means the entity was removed.
    socket.event(
        2,
        json!({
            "event_type": "state_changed",
            "data": { "entity_id": "light.kitchen", "new_state": null },
        }),
    );
    let map = next_map(&mut maps_rx).await;
    assert!(map.is_empty());

    subscription.unsubscribe();
}

#[tokio::test]
async fn test_legacy_hub_refetches_after_reconnect() {
    let (session, mut hub, mut socket) = connect_session("2021.12.0").await;
    let (maps_tx, mut maps_rx) = mpsc::unbounded_channel();

    let subscription = tokio::spawn({
        let session = session.clone();
        async move {
            subscribe_entities(&session, move |entities| {
                let _ = maps_tx.send(entities.clone());
            })
            .await
        }
    });
    socket.expect_type("subscribe_events").await;
    socket.result_ok(2, Value::Null);
    let subscription = subscription.await.unwrap();
    socket.expect_type("get_states").await;
    socket.result_ok(3, json!([kitchen_entity("on")]));
    next_map(&mut maps_rx).await;

    socket.close();

    // The new socket restores the event subscription, then ready triggers
    // a fresh fetch that replaces the stale map.
    let mut socket = hub.next_socket().await;
    socket.auth_handshake("2021.12.0").await;
    let frame = socket.expect_type("subscribe_events").await;
    assert_eq!(frame["id"], 2);
    socket.result_ok(2, Value::Null);
    let frame = socket.expect_type("get_states").await;
    assert_eq!(frame["id"], 3);
    socket.result_ok(3, json!([kitchen_entity("unavailable")]));

    let map = next_map(&mut maps_rx).await;
    assert_eq!(map["light.kitchen"].state, "unavailable");

    subscription.unsubscribe();
}

#[tokio::test]
async fn test_refresh_requires_fetch_support() {
    let (session, _hub, _socket) = connect_session("2023.1.0").await;

    // The streamed transport has no fetch; refresh has nothing to run.
    let collection = entity_collection(&session);
    match collection.refresh().await {
        Err(HearthError::Internal(_)) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_get_states_query() {
    let (session, _hub, mut socket) = connect_session("2023.1.0").await;

    let states = tokio::spawn({
        let session = session.clone();
        async move { get_states(&session).await }
    });

    let frame = socket.expect_type("get_states").await;
    socket.result_ok(frame["id"].as_u64().unwrap(), json!([kitchen_entity("on")]));

    let states = states.await.unwrap().unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].entity_id, "light.kitchen");
    assert_eq!(states[0].attributes["friendly_name"], "Kitchen");
}
