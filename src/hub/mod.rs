//! In-process notification hub.
//!
//! Every successful entity mutation is mirrored to live subscribers.
//! Delivery is best-effort and at-most-once: publishers never block on
//! the hub, and a slow subscriber only loses its own messages.

mod manager;
mod types;

pub use manager::Hub;
pub use types::{
    ClientId, EntityEvent, EntityOp, HubConfig, SubscriberHandle, SubscriptionConfig,
    SubscriptionFilter,
};
