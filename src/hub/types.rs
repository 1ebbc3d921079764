//! Subscription types for live entity updates.

use crate::types::{Entity, Kind, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hub configuration.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Capacity of the global ingress queue shared by all writers.
    /// Sized to absorb write bursts; a full queue drops the publish.
    pub ingress_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ingress_capacity: 5000,
        }
    }
}

/// Configuration for one subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Caller-chosen identifier; a fresh one is generated when `None`.
    pub client_id: Option<ClientId>,

    /// Delivery buffer for this subscriber. A full buffer drops the
    /// message for this subscriber only.
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: SubscriptionFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            buffer_size: 1000,
            filter: SubscriptionFilter::default(),
        }
    }
}

impl SubscriptionConfig {
    /// Default-sized subscription with the given filter.
    pub fn filtered(filter: SubscriptionFilter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }
}

/// What happened to the entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityOp {
    Changed,
    Deleted,
}

/// A committed mutation, fanned out to subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityEvent {
    pub key: String,
    pub kind: Kind,
    pub op: EntityOp,

    /// Snapshot of the entity after the mutation; `None` for deletions.
    pub entity: Option<Entity>,

    /// When the mutation committed.
    pub at: Timestamp,
}

impl EntityEvent {
    /// Event for a committed write.
    pub fn changed(entity: Entity) -> Self {
        Self {
            key: entity.key().to_string(),
            kind: entity.kind(),
            op: EntityOp::Changed,
            at: Timestamp::now(),
            entity: Some(entity),
        }
    }

    /// Event for a committed delete.
    pub fn deleted(key: impl Into<String>, kind: Kind) -> Self {
        Self {
            key: key.into(),
            kind,
            op: EntityOp::Deleted,
            entity: None,
            at: Timestamp::now(),
        }
    }
}

/// Filter criteria for a subscriber. An empty filter matches everything.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    /// Only events for this exact entity key.
    pub key: Option<String>,

    /// Only events for these kinds.
    pub kinds: Option<Vec<Kind>>,
}

impl SubscriptionFilter {
    /// Match all events.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match events for a single entity key.
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    /// Match events for the given kinds.
    pub fn kinds(kinds: Vec<Kind>) -> Self {
        Self {
            kinds: Some(kinds),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &EntityEvent) -> bool {
        if let Some(ref key) = self.key {
            if key != &event.key {
                return false;
            }
        }
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        true
    }
}

/// Opaque subscriber identifier.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        ClientId(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        ClientId(s.to_string())
    }
}

/// Receive-only handle to a subscriber's delivery channel.
///
/// The channel reports disconnection (rather than blocking forever) once
/// the subscriber is unsubscribed or the hub is dropped.
pub struct SubscriberHandle {
    pub client_id: ClientId,
    pub receiver: crossbeam_channel::Receiver<EntityEvent>,
}

impl SubscriberHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<EntityEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<EntityEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<EntityEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
