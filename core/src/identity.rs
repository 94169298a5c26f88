//! Resolved principals and the visibility seam.
//!
//! Authentication and authorization happen outside this core. What crosses
//! the boundary is an already-resolved [`Identity`] attached to events and
//! subscriptions, plus a [`VisibilityPredicate`] supplied by the authorization
//! collaborator. The dispatcher only ever *consults* the predicate; it never
//! computes a permission itself.

use crate::event::DeviceEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An already-resolved principal: a user session, a device session, or both.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// User behind the connection, if any.
    pub user_id: Option<u64>,

    /// Device behind the connection, if any.
    pub device_id: Option<String>,
}

impl Identity {
    /// Identity of a user session.
    #[must_use]
    pub const fn user(user_id: u64) -> Self {
        Self {
            user_id: Some(user_id),
            device_id: None,
        }
    }

    /// Identity of a device session.
    #[must_use]
    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            user_id: None,
            device_id: Some(device_id.into()),
        }
    }
}

/// Decides whether a subscriber identity may see an event.
///
/// Supplied by the authorization collaborator at dispatcher construction.
/// Returning `false` silently skips the subscription for that event.
pub type VisibilityPredicate = Arc<dyn Fn(&Identity, &DeviceEvent) -> bool + Send + Sync>;

/// A predicate that lets every identity see every event.
///
/// Useful as a default in tests and single-tenant deployments.
#[must_use]
pub fn allow_all() -> VisibilityPredicate {
    Arc::new(|_, _| true)
}
