//! Domain events fanned out to live subscriptions.
//!
//! Events are produced by the persistence layer after a successful write and
//! handed to the event dispatcher, which routes them to matching
//! subscriptions. They are treated as immutable once constructed.

use crate::identity::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three event channels the backend produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A command was created for a device.
    CommandInsert,
    /// An existing command's status or result changed.
    CommandUpdate,
    /// A device published a notification.
    NotificationInsert,
}

impl EventKind {
    /// Bus topic this kind of event is published on.
    #[must_use]
    pub const fn topic(self) -> &'static str {
        match self {
            Self::CommandInsert => "command-events",
            Self::CommandUpdate => "command-update-events",
            Self::NotificationInsert => "notification-events",
        }
    }
}

/// A single domain event keyed by the device that emitted or owns it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceEvent {
    /// The event-source key: the device this event belongs to.
    pub device_id: String,

    /// Which channel the event belongs to.
    pub kind: EventKind,

    /// Command or notification name, matched against subscription filters.
    pub name: String,

    /// Event parameters as produced by the domain layer.
    pub payload: serde_json::Value,

    /// Resolved principal that produced the event.
    pub producer: Identity,

    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
}

impl DeviceEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        kind: EventKind,
        name: impl Into<String>,
        payload: serde_json::Value,
        producer: Identity,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
            name: name.into(),
            payload,
            producer,
            timestamp: Utc::now(),
        }
    }
}
