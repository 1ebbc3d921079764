//! # entitydb
//!
//! A single-node store for typed entities (user and organizational
//! accounts) persisted in an embedded, transactional key-value engine,
//! with every mutation republished to live subscribers.
//!
//! ## Core Concepts
//!
//! - **Entities**: tagged records (`User`, `Account`) sharing one flat
//!   keyspace, told apart by an out-of-band kind tag
//! - **Store**: per-operation transactions, pattern and prefix queries,
//!   TTL expiry, bulk delete
//! - **Hub**: in-process pub/sub mirroring every committed mutation to
//!   filter-matching subscribers without ever blocking the writer
//!
//! ## Example
//!
//! ```ignore
//! use entitydb::{EntityStore, StoreConfig, SubscriptionFilter, User};
//!
//! let store = EntityStore::open(StoreConfig {
//!     path: "./my-store".into(),
//!     ..Default::default()
//! })?;
//!
//! let live = store.hub().subscribe(SubscriptionFilter::all());
//!
//! store.put(User {
//!     email: "alice@example.com".into(),
//!     name: "Alice".into(),
//!     ..Default::default()
//! })?;
//!
//! let event = live.recv()?; // alice's committed snapshot
//! ```

pub mod codec;
pub mod engine;
pub mod error;
pub mod hub;
pub mod store;
pub mod types;
pub mod workflows;

// Re-exports
pub use engine::{Engine, ReadTxn, WriteTxn};
pub use error::{Result, StoreError};
pub use hub::{
    ClientId, EntityEvent, EntityOp, Hub, HubConfig, SubscriberHandle, SubscriptionConfig,
    SubscriptionFilter,
};
pub use store::{EntityStore, StoreConfig};
pub use types::{Account, BillingRef, Entity, EntityRecord, Kind, PlanRef, Timestamp, User};
pub use workflows::{BillingProvider, IdentityProfile, SubscriptionRef};
