//! # Devicemesh Core
//!
//! Core abstractions for the devicemesh device-management backend.
//!
//! This crate provides the types shared by every node in the system:
//!
//! - **Bus abstraction**: the [`bus::MessageBus`] trait for publishing and
//!   subscribing to keyed byte messages over a partition-ordered topic service
//! - **Wire envelopes**: [`envelope::Request`] and [`envelope::Response`], the
//!   correlation-tagged messages exchanged by the RPC layer
//! - **Domain events**: [`event::DeviceEvent`], the commands, command updates
//!   and notifications fanned out to live subscriptions
//! - **Identity**: [`identity::Identity`], the already-resolved principal
//!   attached to events and subscriptions
//!
//! ## Architecture Principles
//!
//! - Async-first, dyn-compatible trait seams (`Arc<dyn MessageBus>`)
//! - Immutable values on the wire; mutation only inside registries
//! - Explicit `Result` propagation with per-concern error enums
//! - No hidden I/O: every publish and subscribe goes through the bus trait

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod bus;
pub mod envelope;
pub mod event;
pub mod identity;

pub use bus::{BusError, BusMessage, MessageBus, MessageStream};
pub use envelope::{EnvelopeError, Request, Response, PING_KIND};
pub use event::{DeviceEvent, EventKind};
pub use identity::{Identity, VisibilityPredicate};
