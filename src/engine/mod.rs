//! Embedded transactional key-value engine.
//!
//! A flat byte keyspace with an attachable tag byte and optional absolute
//! expiry per entry. Durability comes from a framed, checksummed
//! append-only commit log; reads are served from an in-memory ordered
//! table rebuilt on open.

mod kv;
mod log;

pub use kv::{Engine, ReadTxn, WriteTxn};
