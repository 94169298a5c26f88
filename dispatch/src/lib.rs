//! # Devicemesh Dispatch
//!
//! Routes asynchronously-arriving device events — new commands, command
//! updates, notifications — to the live client connections that subscribed to
//! them.
//!
//! The [`SubscriptionRegistry`] stores active subscriptions keyed by the
//! device they watch, safe for concurrent add/remove with snapshot iteration.
//! The [`EventDispatcher`] takes each newly-produced
//! [`DeviceEvent`](devicemesh_core::DeviceEvent), snapshots the matching
//! subscriptions, applies the name filter and the externally-supplied
//! visibility predicate, and invokes each surviving subscription's delivery
//! callback. Events for one device are dispatched in receipt order; distinct
//! devices proceed in parallel.

pub mod dispatcher;
pub mod registry;

pub use dispatcher::{DispatcherConfig, EventDispatcher};
pub use registry::{
    DeliverFn, DeliveryError, Subscription, SubscriptionId, SubscriptionRegistry,
};
