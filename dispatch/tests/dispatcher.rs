//! Integration tests for event fan-out through the subscription registry.
//!
//! Covers the filtering seams (name filter, visibility predicate), the
//! unsubscribe and connection-purge paths, failure containment, and the
//! per-device ordering guarantee.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use devicemesh_core::identity::allow_all;
use devicemesh_core::{DeviceEvent, EventKind, Identity, VisibilityPredicate};
use devicemesh_dispatch::{
    DeliverFn, DeliveryError, DispatcherConfig, EventDispatcher, Subscription,
    SubscriptionRegistry,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// Test Fixtures
// ============================================================================

fn event(device_id: &str, kind: EventKind, name: &str) -> DeviceEvent {
    DeviceEvent::new(
        device_id,
        kind,
        name,
        serde_json::json!({ "seq": name }),
        Identity::user(1),
    )
}

/// Delivery callback that forwards each event's name into a channel.
fn capturing_deliver() -> (DeliverFn, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let deliver: DeliverFn = Arc::new(move |event: &DeviceEvent| {
        tx.send(event.name.clone()).ok();
        Ok(())
    });
    (deliver, rx)
}

fn subscription(
    kind: EventKind,
    device_id: &str,
    connection_id: &str,
    names: Option<HashSet<String>>,
    deliver: DeliverFn,
) -> Subscription {
    Subscription::new(kind, device_id, connection_id, Identity::user(1), names, deliver)
}

async fn recv_within(rx: &mut mpsc::UnboundedReceiver<String>, millis: u64) -> String {
    tokio::time::timeout(Duration::from_millis(millis), rx.recv())
        .await
        .expect("delivery should arrive in time")
        .expect("channel should stay open")
}

async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<String>) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "no delivery expected");
}

// ============================================================================
// Tests
// ============================================================================

/// A name-filtered subscription receives only events carrying one of its
/// names, and only for its own device and kind.
#[tokio::test]
async fn name_filter_restricts_deliveries() {
    let registry = Arc::new(SubscriptionRegistry::new());
    let (deliver, mut rx) = capturing_deliver();
    registry.add(subscription(
        EventKind::CommandInsert,
        "d-1",
        "conn-1",
        Some(HashSet::from(["activate".to_owned()])),
        deliver,
    ));

    let dispatcher = EventDispatcher::new(
        Arc::clone(&registry),
        allow_all(),
        DispatcherConfig::default(),
    );

    dispatcher.dispatch(event("d-1", EventKind::CommandInsert, "reboot"));
    dispatcher.dispatch(event("d-2", EventKind::CommandInsert, "activate"));
    dispatcher.dispatch(event("d-1", EventKind::NotificationInsert, "activate"));
    dispatcher.dispatch(event("d-1", EventKind::CommandInsert, "activate"));

    assert_eq!(recv_within(&mut rx, 2000).await, "activate");
    assert_silent(&mut rx).await;
}

/// The dispatcher consults the supplied predicate and silently skips denied
/// subscriber/event pairings.
#[tokio::test]
async fn visibility_predicate_hides_events() {
    let registry = Arc::new(SubscriptionRegistry::new());

    let (allowed_deliver, mut allowed_rx) = capturing_deliver();
    registry.add(Subscription::new(
        EventKind::NotificationInsert,
        "d-1",
        "conn-1",
        Identity::user(1),
        None,
        allowed_deliver,
    ));

    let (denied_deliver, mut denied_rx) = capturing_deliver();
    registry.add(Subscription::new(
        EventKind::NotificationInsert,
        "d-1",
        "conn-2",
        Identity::user(2),
        None,
        denied_deliver,
    ));

    // Only user 1 may see anything.
    let visibility: VisibilityPredicate =
        Arc::new(|identity, _event| identity.user_id == Some(1));
    let dispatcher = EventDispatcher::new(
        Arc::clone(&registry),
        visibility,
        DispatcherConfig::default(),
    );

    dispatcher.dispatch(event("d-1", EventKind::NotificationInsert, "temperature"));

    assert_eq!(recv_within(&mut allowed_rx, 2000).await, "temperature");
    assert_silent(&mut denied_rx).await;
}

/// After `remove_by_id` returns, the next dispatch never includes the
/// removed subscription.
#[tokio::test]
async fn unsubscribe_excludes_from_next_dispatch() {
    let registry = Arc::new(SubscriptionRegistry::new());
    let (deliver, mut rx) = capturing_deliver();
    let handle = registry.add(subscription(
        EventKind::CommandInsert,
        "d-1",
        "conn-1",
        None,
        deliver,
    ));

    let dispatcher = EventDispatcher::new(
        Arc::clone(&registry),
        allow_all(),
        DispatcherConfig::default(),
    );

    dispatcher.dispatch(event("d-1", EventKind::CommandInsert, "before"));
    assert_eq!(recv_within(&mut rx, 2000).await, "before");

    assert!(registry.remove_by_id(handle.id));
    dispatcher.dispatch(event("d-1", EventKind::CommandInsert, "after"));
    assert_silent(&mut rx).await;
}

/// A delivery failing with `ConnectionClosed` purges every subscription of
/// that connection; other connections keep receiving.
#[tokio::test]
async fn closed_connection_is_purged() {
    let registry = Arc::new(SubscriptionRegistry::new());

    let closed: DeliverFn = Arc::new(|_| Err(DeliveryError::ConnectionClosed));
    registry.add(subscription(
        EventKind::CommandInsert,
        "d-1",
        "conn-dead",
        None,
        closed,
    ));
    registry.add(subscription(
        EventKind::NotificationInsert,
        "d-2",
        "conn-dead",
        None,
        Arc::new(|_| Ok(())),
    ));

    let (live_deliver, mut live_rx) = capturing_deliver();
    registry.add(subscription(
        EventKind::CommandInsert,
        "d-1",
        "conn-live",
        None,
        live_deliver,
    ));
    assert_eq!(registry.len(), 3);

    let dispatcher = EventDispatcher::new(
        Arc::clone(&registry),
        allow_all(),
        DispatcherConfig::default(),
    );

    dispatcher.dispatch(event("d-1", EventKind::CommandInsert, "first"));
    assert_eq!(recv_within(&mut live_rx, 2000).await, "first");

    // Both of the dead connection's subscriptions are gone, on every device.
    tokio::time::timeout(Duration::from_secs(2), async {
        while registry.len() != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("dead connection should be purged");

    dispatcher.dispatch(event("d-1", EventKind::CommandInsert, "second"));
    assert_eq!(recv_within(&mut live_rx, 2000).await, "second");
}

/// One failing subscription never aborts dispatch to the remaining ones.
#[tokio::test]
async fn delivery_failure_is_contained() {
    let registry = Arc::new(SubscriptionRegistry::new());

    let failing: DeliverFn = Arc::new(|_| Err(DeliveryError::Failed("serialization".to_owned())));
    registry.add(subscription(
        EventKind::CommandInsert,
        "d-1",
        "conn-1",
        None,
        failing,
    ));

    let (deliver, mut rx) = capturing_deliver();
    registry.add(subscription(
        EventKind::CommandInsert,
        "d-1",
        "conn-2",
        None,
        deliver,
    ));

    let dispatcher = EventDispatcher::new(
        Arc::clone(&registry),
        allow_all(),
        DispatcherConfig::default(),
    );

    dispatcher.dispatch(event("d-1", EventKind::CommandInsert, "survives"));
    assert_eq!(recv_within(&mut rx, 2000).await, "survives");

    // A plain failure does not unsubscribe anything.
    assert_eq!(registry.len(), 2);
}

/// Events for one device arrive in dispatch order, even with several shard
/// workers running and another device interleaving.
#[tokio::test]
async fn per_device_dispatch_order_is_preserved() {
    let registry = Arc::new(SubscriptionRegistry::new());
    let (deliver_a, mut rx_a) = capturing_deliver();
    registry.add(subscription(
        EventKind::CommandUpdate,
        "d-a",
        "conn-1",
        None,
        deliver_a,
    ));
    let (deliver_b, mut rx_b) = capturing_deliver();
    registry.add(subscription(
        EventKind::CommandUpdate,
        "d-b",
        "conn-2",
        None,
        deliver_b,
    ));

    let dispatcher = EventDispatcher::new(
        Arc::clone(&registry),
        allow_all(),
        DispatcherConfig { shard_count: 4 },
    );

    for i in 0..100 {
        dispatcher.dispatch(event("d-a", EventKind::CommandUpdate, &format!("a-{i}")));
        dispatcher.dispatch(event("d-b", EventKind::CommandUpdate, &format!("b-{i}")));
    }

    for i in 0..100 {
        assert_eq!(recv_within(&mut rx_a, 2000).await, format!("a-{i}"));
        assert_eq!(recv_within(&mut rx_b, 2000).await, format!("b-{i}"));
    }
}

/// Shutdown drains queued events before the workers exit.
#[tokio::test]
async fn shutdown_drains_in_flight_events() {
    let registry = Arc::new(SubscriptionRegistry::new());
    let (deliver, mut rx) = capturing_deliver();
    registry.add(subscription(
        EventKind::NotificationInsert,
        "d-1",
        "conn-1",
        None,
        deliver,
    ));

    let dispatcher = EventDispatcher::new(
        Arc::clone(&registry),
        allow_all(),
        DispatcherConfig::default(),
    );

    for i in 0..10 {
        dispatcher.dispatch(event("d-1", EventKind::NotificationInsert, &format!("n-{i}")));
    }
    dispatcher.shutdown().await;

    for i in 0..10 {
        assert_eq!(recv_within(&mut rx, 2000).await, format!("n-{i}"));
    }
}
