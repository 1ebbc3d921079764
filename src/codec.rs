//! Binary codec for entity values.
//!
//! Entities are stored as an opaque, length-prefixed envelope:
//! `version u8 | payload_len u32 LE | payload`. The payload is
//! MessagePack, which together with `#[serde(default)]` on optional
//! fields keeps the encoding stable across additive field evolution.

use crate::error::{Result, StoreError};
use crate::types::Entity;

/// Current envelope version.
const CODEC_VERSION: u8 = 1;

/// Envelope header size: version + length prefix.
const HEADER_SIZE: usize = 1 + 4;

/// Encode an entity into its stored representation.
pub fn encode_entity(entity: &Entity) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(entity)?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.push(CODEC_VERSION);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a stored representation back into an entity.
pub fn decode_entity(bytes: &[u8]) -> Result<Entity> {
    if bytes.len() < HEADER_SIZE {
        return Err(StoreError::Corruption("entity envelope too short".into()));
    }

    let version = bytes[0];
    if version != CODEC_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "unsupported entity envelope version: {}",
            version
        )));
    }

    let len = u32::from_le_bytes(bytes[1..5].try_into().expect("sized slice")) as usize;
    let payload = &bytes[HEADER_SIZE..];
    if payload.len() != len {
        return Err(StoreError::Corruption(format!(
            "entity envelope length mismatch: header says {}, got {}",
            len,
            payload.len()
        )));
    }

    Ok(rmp_serde::from_slice(payload)?)
}
