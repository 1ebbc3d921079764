//! Typed entity store over the KV engine.
//!
//! Two entity kinds share one flat keyspace, told apart by the tag byte
//! the engine attaches to every entry. Each operation opens exactly one
//! transaction, commits (mutations) or discards (reads) before
//! returning, and mirrors every successful mutation to the hub.

use crate::codec::{decode_entity, encode_entity};
use crate::engine::Engine;
use crate::error::{Result, StoreError};
use crate::hub::{EntityEvent, Hub, HubConfig};
use crate::types::{EntityRecord, Kind, Timestamp};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Sentinel key list that wipes the entire store.
const WIPE_SENTINEL: &str = "*";

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory owned exclusively by this store instance.
    pub path: PathBuf,

    /// Commits per fsync; 1 = every commit (safest).
    pub sync_interval: u64,

    /// Background reclamation interval for expired/deleted space.
    /// `None` disables the background pass; `reclaim` can still be
    /// called directly.
    pub reclaim_interval: Option<Duration>,

    /// Notification hub sizing.
    pub hub: HubConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./entitydb"),
            sync_interval: 1,
            reclaim_interval: Some(Duration::from_secs(300)),
            hub: HubConfig::default(),
        }
    }
}

/// The entity store.
pub struct EntityStore {
    engine: Arc<Engine>,
    hub: Arc<Hub>,
    reclaimer: Option<(Sender<()>, JoinHandle<()>)>,
}

impl EntityStore {
    /// Open or create a store at the configured path, start the hub
    /// dispatch worker and, if configured, the background reclaimer.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let engine = Arc::new(Engine::open(&config.path, config.sync_interval)?);

        let hub = Arc::new(Hub::new(config.hub.clone()));
        hub.start();

        let reclaimer = config.reclaim_interval.map(|interval| {
            let (stop_tx, stop_rx) = bounded::<()>(1);
            let engine = Arc::clone(&engine);
            let handle = std::thread::spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = engine.reclaim() {
                            tracing::warn!(error = %e, "background reclamation failed");
                        }
                    }
                }
            });
            (stop_tx, handle)
        });

        Ok(Self {
            engine,
            hub,
            reclaimer,
        })
    }

    /// The notification hub for this store.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    // --- Mutations ---

    /// Validate, stamp and persist an entity in one transaction tagged
    /// with its kind, then publish the committed snapshot.
    ///
    /// A zero `updated_at` is assigned the current time; the stored value
    /// is a full replacement, not a merge. Returns the entity as stored.
    pub fn put<R: EntityRecord>(&self, mut record: R) -> Result<R> {
        record.validate()?;
        if record.updated_at().is_zero() {
            record.set_updated_at(Timestamp::now());
        }

        let entity = record.clone().into_entity();
        let value = encode_entity(&entity)?;

        let mut txn = self.engine.write_txn();
        txn.set(
            record.key().as_bytes(),
            R::KIND.tag(),
            expiry_secs(record.expires_at()),
            value,
        );
        txn.commit()?;

        self.hub.publish(EntityEvent::changed(entity));
        Ok(record)
    }

    /// Fetch the entity under `key`, or create it from `init` if absent.
    /// Returns the entity and whether it was created.
    ///
    /// The upsert primitive behind first-login flows: the read and the
    /// conditional write share one transaction, so two racing callers
    /// serialize with one creating and the other surfacing `Conflict`.
    pub fn get_or_create<R, F>(&self, key: &str, init: F) -> Result<(R, bool)>
    where
        R: EntityRecord,
        F: FnOnce() -> R,
    {
        let mut txn = self.engine.write_txn();

        if let Some((tag, value)) = txn.get(key.as_bytes()) {
            if tag != R::KIND.tag() {
                // Keys are globally unique; creating here would shadow the
                // other kind's entity.
                return Err(StoreError::InvalidArgument(format!(
                    "key {} already exists under another kind",
                    key
                )));
            }
            let record = decode_record::<R>(key, &value)?;
            return Ok((record, false));
        }

        let mut record = init();
        if record.key() != key {
            return Err(StoreError::InvalidArgument(format!(
                "initializer produced key {}, expected {}",
                record.key(),
                key
            )));
        }
        record.validate()?;
        if record.updated_at().is_zero() {
            record.set_updated_at(Timestamp::now());
        }

        let entity = record.clone().into_entity();
        txn.set(
            key.as_bytes(),
            R::KIND.tag(),
            expiry_secs(record.expires_at()),
            encode_entity(&entity)?,
        );
        txn.commit()?;

        self.hub.publish(EntityEvent::changed(entity));
        Ok((record, true))
    }

    /// Delete exactly the given keys in one transaction; missing keys are
    /// not an error. The sentinel list `["*"]` wipes the entire store.
    /// Each deleted live entity publishes a deletion event.
    pub fn delete(&self, keys: &[&str]) -> Result<()> {
        if keys.first() == Some(&WIPE_SENTINEL) {
            return self.wipe();
        }

        let mut txn = self.engine.write_txn();
        let mut events = Vec::new();

        for key in keys {
            if let Some((tag, _)) = txn.get(key.as_bytes()) {
                if let Some(kind) = Kind::from_tag(tag) {
                    events.push(EntityEvent::deleted(*key, kind));
                }
            }
            txn.delete(key.as_bytes());
        }
        txn.commit()?;

        for event in events {
            self.hub.publish(event);
        }
        Ok(())
    }

    /// Wipe all entities of all kinds. Irreversible.
    pub fn wipe(&self) -> Result<()> {
        self.engine.wipe()?;
        tracing::warn!("store wiped");
        Ok(())
    }

    // --- Reads ---

    /// Batch fetch. An empty key list returns every entity of this kind
    /// (full scan). Explicit keys are fetched point-wise; keys that are
    /// absent, expired, or stored under another kind are silently
    /// omitted, and callers detect them by absence in the result map.
    pub fn get<R: EntityRecord>(&self, keys: &[&str]) -> Result<BTreeMap<String, R>> {
        let txn = self.engine.read_txn();
        let mut out = BTreeMap::new();

        if keys.is_empty() {
            for (key, value) in txn.scan(R::KIND.tag()) {
                let key = string_key(&key)?;
                let record = decode_record::<R>(&key, &value)?;
                out.insert(key, record);
            }
        } else {
            for key in keys {
                if let Some((tag, value)) = txn.get(key.as_bytes()) {
                    if tag != R::KIND.tag() {
                        continue;
                    }
                    out.insert(key.to_string(), decode_record::<R>(key, &value)?);
                }
            }
        }

        Ok(out)
    }

    /// Single-key fetch. Fails with `NotFound` if the key is absent or
    /// stored under another kind; the other kind's existence is not
    /// revealed.
    pub fn get_one<R: EntityRecord>(&self, key: &str) -> Result<R> {
        let txn = self.engine.read_txn();
        match txn.get(key.as_bytes()) {
            Some((tag, value)) if tag == R::KIND.tag() => decode_record::<R>(key, &value),
            _ => Err(StoreError::NotFound(key.to_string())),
        }
    }

    /// Linear scan over this kind's keys, returning entities whose whole
    /// key matches `pattern`. Fails with `InvalidArgument` on a pattern
    /// that does not compile, with no partial results.
    pub fn get_by_pattern<R: EntityRecord>(&self, pattern: &str) -> Result<BTreeMap<String, R>> {
        let regex = compile_full_match(pattern)?;

        let txn = self.engine.read_txn();
        let mut out = BTreeMap::new();
        for (key, value) in txn.scan(R::KIND.tag()) {
            let key = string_key(&key)?;
            if regex.is_match(&key) {
                let record = decode_record::<R>(&key, &value)?;
                out.insert(key, record);
            }
        }
        Ok(out)
    }

    /// Ordered range scan over this kind's keys with the given
    /// lexicographic prefix. Uses the engine's native sorted iteration.
    pub fn get_by_prefix<R: EntityRecord>(&self, prefix: &str) -> Result<BTreeMap<String, R>> {
        let txn = self.engine.read_txn();
        let mut out = BTreeMap::new();
        for (key, value) in txn.scan_prefix(R::KIND.tag(), prefix.as_bytes()) {
            let key = string_key(&key)?;
            let record = decode_record::<R>(&key, &value)?;
            out.insert(key, record);
        }
        Ok(out)
    }

    /// All keys of this kind. Keys-only iteration: values are neither
    /// copied nor deserialized.
    pub fn list_keys<R: EntityRecord>(&self) -> Result<Vec<String>> {
        let txn = self.engine.read_txn();
        txn.scan_keys(R::KIND.tag())
            .into_iter()
            .map(|key| string_key(&key))
            .collect()
    }

    /// Keys of this kind whose whole key matches `pattern`.
    pub fn list_keys_by_pattern<R: EntityRecord>(&self, pattern: &str) -> Result<Vec<String>> {
        let regex = compile_full_match(pattern)?;
        Ok(self
            .list_keys::<R>()?
            .into_iter()
            .filter(|key| regex.is_match(key))
            .collect())
    }

    // --- Maintenance ---

    /// Run one reclamation pass now. Returns the number of expired
    /// entries dropped.
    pub fn reclaim(&self) -> Result<usize> {
        self.engine.reclaim()
    }

    /// Flush pending commits to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.engine.sync()
    }
}

impl Drop for EntityStore {
    fn drop(&mut self) {
        if let Some((stop_tx, handle)) = self.reclaimer.take() {
            let _ = stop_tx.try_send(());
            let _ = handle.join();
        }
        self.hub.stop();
        if let Err(e) = self.engine.sync() {
            tracing::warn!(error = %e, "final sync failed on close");
        }
    }
}

/// Compile `pattern` anchored to match the whole key.
fn compile_full_match(pattern: &str) -> Result<Regex> {
    // Validate the caller's pattern on its own so errors point at it.
    Regex::new(pattern).map_err(|e| StoreError::InvalidArgument(e.to_string()))?;
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| StoreError::InvalidArgument(e.to_string()))
}

fn string_key(key: &[u8]) -> Result<String> {
    String::from_utf8(key.to_vec())
        .map_err(|_| StoreError::Corruption("non-utf8 key in keyspace".into()))
}

fn decode_record<R: EntityRecord>(key: &str, value: &[u8]) -> Result<R> {
    let entity = decode_entity(value)?;
    R::from_entity(entity).ok_or_else(|| {
        StoreError::Corruption(format!(
            "tag and payload kind disagree for key {}",
            key
        ))
    })
}

fn expiry_secs(at: Timestamp) -> u64 {
    if at.0 <= 0 {
        0
    } else {
        at.0 as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Account, User};
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> EntityStore {
        EntityStore::open(StoreConfig {
            path: dir.path().join("store"),
            reclaim_interval: None,
            ..Default::default()
        })
        .unwrap()
    }

    fn user(email: &str, name: &str) -> User {
        User {
            email: email.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_put_assigns_updated_at() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let before = Timestamp::now();
        let stored = store.put(user("alice@example.com", "Alice")).unwrap();
        assert!(stored.updated_at >= before);

        // A caller-supplied timestamp is preserved.
        let mut u = user("bob@example.com", "Bob");
        u.updated_at = Timestamp(12345);
        let stored = store.put(u).unwrap();
        assert_eq!(stored.updated_at, Timestamp(12345));
    }

    #[test]
    fn test_put_rejects_invalid() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let err = store.put(user("", "NoEmail")).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        // Nothing was committed.
        assert!(store.get::<User>(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_get_one_not_found() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        assert!(matches!(
            store.get_one::<User>("nobody@example.com"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_invalid_pattern() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        assert!(matches!(
            store.get_by_pattern::<User>("("),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.list_keys_by_pattern::<User>("["),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_pattern_matches_whole_key() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.put(user("alice@example.com", "Alice")).unwrap();
        store.put(user("alice@example.org", "Alice2")).unwrap();

        // Unanchored substring alone must not match.
        let hits = store.get_by_pattern::<User>("alice").unwrap();
        assert!(hits.is_empty());

        let hits = store.get_by_pattern::<User>(r"alice@example\.(com|org)").unwrap();
        assert_eq!(hits.len(), 2);

        let hits = store.get_by_pattern::<User>(r".*\.com").unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_get_or_create_kind_collision() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store
            .put(Account {
                name: "shared-key".into(),
                admin_email: "admin@acme.com".into(),
                ..Default::default()
            })
            .unwrap();

        let result = store.get_or_create::<User, _>("shared-key", || user("shared-key", "X"));
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn test_get_or_create_initializer_key_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let result =
            store.get_or_create::<User, _>("a@b.c", || user("different@b.c", "X"));
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    }
}
