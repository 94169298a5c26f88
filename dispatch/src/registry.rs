//! Store of active subscriptions, keyed by what they watch.
//!
//! A subscription is created when a client connection asks to watch a device
//! channel and destroyed on explicit unsubscribe or when the owning
//! connection closes. Several subscriptions may watch the same device; the
//! registry keeps them side by side and removes strictly by id, never by
//! value equality.
//!
//! Dispatch iterates over a point-in-time snapshot, so a removal racing an
//! in-flight dispatch is safe: the worst case is one extra delivery to the
//! just-removed subscription, never a crash or a torn read.

use devicemesh_core::{DeviceEvent, EventKind, Identity};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier of one subscription.
pub type SubscriptionId = Uuid;

/// Errors a delivery callback can report back to the dispatcher.
#[derive(Error, Debug, Clone)]
pub enum DeliveryError {
    /// The connection behind the subscription is gone; the dispatcher
    /// responds by purging all subscriptions of that connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Any other delivery failure; logged and otherwise ignored.
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Callback pushing a matching event to the live connection.
///
/// Supplied by the connection layer; typically serializes the event and
/// enqueues it on a WebSocket session.
pub type DeliverFn = Arc<dyn Fn(&DeviceEvent) -> Result<(), DeliveryError> + Send + Sync>;

/// A standing registration to receive events for one device channel.
///
/// `kind`, `device_id` and `id` are immutable after creation.
pub struct Subscription {
    /// Unique id; the only removal key.
    pub id: SubscriptionId,

    /// Which event channel this subscription watches.
    pub kind: EventKind,

    /// The device being watched (the event-source key).
    pub device_id: String,

    /// Connection owning this subscription; used for bulk removal on close.
    pub connection_id: String,

    /// Resolved principal, consulted by the dispatcher's visibility check.
    pub identity: Identity,

    /// Optional restriction to specific command/notification names.
    pub names: Option<HashSet<String>>,

    deliver: DeliverFn,
}

impl Subscription {
    /// Create a subscription with a fresh id.
    #[must_use]
    pub fn new(
        kind: EventKind,
        device_id: impl Into<String>,
        connection_id: impl Into<String>,
        identity: Identity,
        names: Option<HashSet<String>>,
        deliver: DeliverFn,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            device_id: device_id.into(),
            connection_id: connection_id.into(),
            identity,
            names,
            deliver,
        }
    }

    /// Whether an event name passes this subscription's name filter.
    #[must_use]
    pub fn matches_name(&self, name: &str) -> bool {
        match &self.names {
            Some(names) => names.contains(name),
            None => true,
        }
    }

    /// Push an event to the owning connection.
    ///
    /// # Errors
    ///
    /// Propagates whatever the connection layer's callback reports.
    pub fn deliver(&self, event: &DeviceEvent) -> Result<(), DeliveryError> {
        (self.deliver)(event)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("device_id", &self.device_id)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

type Key = (EventKind, String);

#[derive(Default)]
struct Inner {
    by_key: HashMap<Key, Vec<Arc<Subscription>>>,
    by_id: HashMap<SubscriptionId, Arc<Subscription>>,
    by_connection: HashMap<String, Vec<SubscriptionId>>,
}

/// Thread-safe store of active subscriptions.
///
/// All three indexes mutate under one write lock, so every observer sees a
/// consistent view. Lookups by key are O(1) amortized.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert a subscription and return a shared handle to it.
    pub fn add(&self, subscription: Subscription) -> Arc<Subscription> {
        let subscription = Arc::new(subscription);
        let mut inner = self.write();
        inner
            .by_key
            .entry((subscription.kind, subscription.device_id.clone()))
            .or_default()
            .push(Arc::clone(&subscription));
        inner
            .by_id
            .insert(subscription.id, Arc::clone(&subscription));
        inner
            .by_connection
            .entry(subscription.connection_id.clone())
            .or_default()
            .push(subscription.id);
        tracing::debug!(
            subscription_id = %subscription.id,
            device_id = %subscription.device_id,
            kind = ?subscription.kind,
            "subscription added"
        );
        subscription
    }

    /// Remove one subscription by id. Idempotent.
    ///
    /// After this returns, the next snapshot never includes the subscription.
    pub fn remove_by_id(&self, id: SubscriptionId) -> bool {
        let mut inner = self.write();
        let Some(subscription) = inner.by_id.remove(&id) else {
            return false;
        };
        detach(&mut inner, &subscription);
        tracing::debug!(subscription_id = %id, "subscription removed");
        true
    }

    /// Remove every subscription owned by a connection.
    ///
    /// Used when a client connection closes. Returns how many were removed.
    pub fn remove_all_for_connection(&self, connection_id: &str) -> usize {
        let mut inner = self.write();
        let Some(ids) = inner.by_connection.remove(connection_id) else {
            return 0;
        };
        let mut removed = 0;
        for id in ids {
            if let Some(subscription) = inner.by_id.remove(&id) {
                detach_from_key(&mut inner, &subscription);
                removed += 1;
            }
        }
        tracing::debug!(connection_id = %connection_id, removed, "connection subscriptions purged");
        removed
    }

    /// Point-in-time snapshot of the subscriptions watching one key.
    ///
    /// Insertion order among subscriptions for the same key is preserved but
    /// carries no delivery-priority meaning.
    #[must_use]
    pub fn snapshot_for(&self, kind: EventKind, device_id: &str) -> Vec<Arc<Subscription>> {
        self.read()
            .by_key
            .get(&(kind, device_id.to_owned()))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    /// Whether no subscriptions are active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().by_id.is_empty()
    }
}

/// Unlink a subscription from the key and connection indexes.
fn detach(inner: &mut Inner, subscription: &Subscription) {
    detach_from_key(inner, subscription);
    let drained = match inner.by_connection.get_mut(&subscription.connection_id) {
        Some(ids) => {
            ids.retain(|candidate| *candidate != subscription.id);
            ids.is_empty()
        }
        None => false,
    };
    if drained {
        inner.by_connection.remove(&subscription.connection_id);
    }
}

fn detach_from_key(inner: &mut Inner, subscription: &Subscription) {
    let key = (subscription.kind, subscription.device_id.clone());
    let drained = match inner.by_key.get_mut(&key) {
        Some(subscriptions) => {
            subscriptions.retain(|candidate| candidate.id != subscription.id);
            subscriptions.is_empty()
        }
        None => false,
    };
    if drained {
        inner.by_key.remove(&key);
    }
}
