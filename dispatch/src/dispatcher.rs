//! Fan-out of device events to matching subscriptions.
//!
//! Events arrive from the persistence layer after a successful write and are
//! enqueued onto one of a fixed set of shard workers, selected by hashing the
//! device id. One device always lands on the same shard, so its events are
//! dispatched in receipt order; different devices spread across shards and
//! proceed in parallel. Nothing here blocks the producer: `dispatch` is a
//! synchronous enqueue.

use crate::registry::{DeliveryError, SubscriptionRegistry};
use devicemesh_core::{DeviceEvent, VisibilityPredicate};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Configuration for an [`EventDispatcher`].
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Number of shard workers. More shards means more cross-device
    /// parallelism; events for one device are always serialized regardless.
    pub shard_count: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { shard_count: 4 }
    }
}

/// Routes domain events to the live subscriptions watching them.
///
/// Per-subscription failures are contained: a failed delivery is logged and
/// never aborts dispatch to the remaining subscriptions for the same event.
/// A delivery that fails because its connection is gone additionally purges
/// every subscription of that connection.
pub struct EventDispatcher {
    shards: Vec<mpsc::UnboundedSender<DeviceEvent>>,
    workers: Vec<JoinHandle<()>>,
}

impl EventDispatcher {
    /// Spawn the shard workers over the given registry and visibility seam.
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        visibility: VisibilityPredicate,
        config: DispatcherConfig,
    ) -> Self {
        let shard_count = config.shard_count.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);

        for shard in 0..shard_count {
            let (tx, rx) = mpsc::unbounded_channel();
            shards.push(tx);
            workers.push(tokio::spawn(run_shard(
                shard,
                rx,
                Arc::clone(&registry),
                Arc::clone(&visibility),
            )));
        }

        tracing::info!(shards = shard_count, "event dispatcher started");
        Self { shards, workers }
    }

    /// Enqueue an event for fan-out.
    ///
    /// Returns immediately; delivery happens on the shard worker owning this
    /// event's device. If that worker has already stopped, the event is
    /// dropped with a warning.
    pub fn dispatch(&self, event: DeviceEvent) {
        let shard = shard_for(&event.device_id, self.shards.len());
        if self.shards[shard].send(event).is_err() {
            tracing::warn!(shard, "dispatcher stopped, event dropped");
        }
    }

    /// Close the shard queues and wait for in-flight dispatches to drain.
    pub async fn shutdown(self) {
        drop(self.shards);
        for worker in self.workers {
            let _ = worker.await;
        }
        tracing::info!("event dispatcher stopped");
    }
}

/// Stable shard selection: same device, same shard.
fn shard_for(device_id: &str, shard_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    device_id.hash(&mut hasher);
    usize::try_from(hasher.finish() % shard_count as u64).unwrap_or(0)
}

/// One shard worker: deliver queued events to their matching subscriptions,
/// in queue order.
async fn run_shard(
    shard: usize,
    mut rx: mpsc::UnboundedReceiver<DeviceEvent>,
    registry: Arc<SubscriptionRegistry>,
    visibility: VisibilityPredicate,
) {
    while let Some(event) = rx.recv().await {
        let subscriptions = registry.snapshot_for(event.kind, &event.device_id);
        tracing::debug!(
            shard,
            device_id = %event.device_id,
            name = %event.name,
            candidates = subscriptions.len(),
            "dispatching event"
        );

        for subscription in subscriptions {
            if !subscription.matches_name(&event.name) {
                continue;
            }
            if !visibility(&subscription.identity, &event) {
                tracing::debug!(
                    subscription_id = %subscription.id,
                    "event hidden from subscriber"
                );
                continue;
            }
            if let Err(e) = subscription.deliver(&event) {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    connection_id = %subscription.connection_id,
                    error = %e,
                    "event delivery failed"
                );
                if matches!(e, DeliveryError::ConnectionClosed) {
                    let removed = registry.remove_all_for_connection(&subscription.connection_id);
                    tracing::info!(
                        connection_id = %subscription.connection_id,
                        removed,
                        "closed connection purged from registry"
                    );
                }
            }
        }
    }
    tracing::debug!(shard, "shard worker exiting");
}
