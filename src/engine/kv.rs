//! Transactional KV engine over the commit log.
//!
//! The engine owns an opaque directory exclusively (fs2 advisory lock).
//! All live entries are kept in an in-memory ordered table rebuilt from
//! the commit log on open; values are detached copies on the way out.
//!
//! Isolation is optimistic: write transactions record the version of
//! every entry they read, and commit validates that read-set. Two
//! concurrent writers to the same key serialize through the commit lock,
//! with the loser surfacing a `Conflict` for the caller to retry.

use super::log::{CommitLog, LogOp};
use crate::error::{Result, StoreError};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Magic bytes for the engine manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"EDB\0";

/// Current engine format version.
const ENGINE_VERSION: u8 = 1;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A live table entry.
#[derive(Clone)]
struct Slot {
    tag: u8,
    /// Absolute expiry in epoch seconds; 0 = never.
    expires_at: u64,
    /// Commit version that last wrote this slot.
    version: u64,
    value: Arc<Vec<u8>>,
}

impl Slot {
    fn expired(&self, now: u64) -> bool {
        self.expires_at != 0 && self.expires_at <= now
    }
}

/// The embedded KV engine.
pub struct Engine {
    _lock_file: File,
    table: RwLock<BTreeMap<Vec<u8>, Slot>>,
    log: CommitLog,
    /// Guards the commit section; holds the next commit version.
    commit: Mutex<u64>,
}

impl Engine {
    /// Open or create an engine at `dir`, replaying the commit log.
    ///
    /// Fails with `Locked` if another process owns the directory.
    pub fn open(dir: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        Self::write_or_verify_manifest(&dir)?;
        let lock_file = Self::acquire_lock(&dir)?;

        let mut table: BTreeMap<Vec<u8>, Slot> = BTreeMap::new();
        let mut version = 0u64;
        let now = now_secs();

        let log = CommitLog::open(dir.join("commit.log"), sync_interval, |batch| {
            version += 1;
            for op in batch {
                match op {
                    LogOp::Set {
                        key,
                        tag,
                        expires_at,
                        value,
                    } => {
                        // Entries already past expiry are not resurrected.
                        if expires_at != 0 && expires_at <= now {
                            table.remove(&key);
                            continue;
                        }
                        table.insert(
                            key,
                            Slot {
                                tag,
                                expires_at,
                                version,
                                value: Arc::new(value),
                            },
                        );
                    }
                    LogOp::Delete { key } => {
                        table.remove(&key);
                    }
                    LogOp::Wipe => {
                        table.clear();
                    }
                }
            }
        })?;

        Ok(Self {
            _lock_file: lock_file,
            table: RwLock::new(table),
            log,
            commit: Mutex::new(version + 1),
        })
    }

    fn write_or_verify_manifest(dir: &Path) -> Result<()> {
        let path = dir.join("MANIFEST");
        if path.exists() {
            let mut file = File::open(&path)?;
            let mut header = [0u8; 5];
            file.read_exact(&mut header)?;
            if &header[0..4] != MANIFEST_MAGIC {
                return Err(StoreError::InvalidFormat("invalid manifest magic".into()));
            }
            if header[4] != ENGINE_VERSION {
                return Err(StoreError::InvalidFormat(format!(
                    "unsupported engine version: {}",
                    header[4]
                )));
            }
        } else {
            let mut file = File::create(&path)?;
            file.write_all(MANIFEST_MAGIC)?;
            file.write_all(&[ENGINE_VERSION])?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn acquire_lock(dir: &Path) -> Result<File> {
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }

    /// Begin a read-only transaction.
    pub fn read_txn(&self) -> ReadTxn<'_> {
        ReadTxn {
            engine: self,
            now: now_secs(),
        }
    }

    /// Begin a read-write transaction.
    pub fn write_txn(&self) -> WriteTxn<'_> {
        WriteTxn {
            engine: self,
            now: now_secs(),
            reads: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Wipe all entries of all kinds. Atomic and durable on return.
    pub fn wipe(&self) -> Result<()> {
        let _commit = self.commit.lock();
        self.log.reset()?;
        self.table.write().clear();
        tracing::debug!("engine wiped");
        Ok(())
    }

    /// Reclaim space held by deleted and expired entries by rewriting the
    /// commit log to contain only live slots. Intended to run on a
    /// background interval.
    pub fn reclaim(&self) -> Result<usize> {
        let mut next_version = self.commit.lock();
        let now = now_secs();

        let dropped = {
            let mut table = self.table.write();
            let expired: Vec<Vec<u8>> = table
                .iter()
                .filter(|(_, slot)| slot.expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                table.remove(key);
            }
            expired.len()
        };

        let batches: Vec<Vec<LogOp>> = {
            let table = self.table.read();
            table
                .iter()
                .map(|(key, slot)| {
                    vec![LogOp::Set {
                        key: key.clone(),
                        tag: slot.tag,
                        expires_at: slot.expires_at,
                        value: slot.value.as_ref().clone(),
                    }]
                })
                .collect()
        };

        self.log.rewrite(&batches)?;
        // Rewriting collapses history into one version generation.
        *next_version += 1;

        tracing::debug!(expired = dropped, live = batches.len(), "log reclaimed");
        Ok(dropped)
    }

    /// Force pending log writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Number of live (unexpired) entries across all tags.
    pub fn len(&self) -> usize {
        let now = now_secs();
        self.table
            .read()
            .values()
            .filter(|slot| !slot.expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only transaction. Holds no locks between calls; every returned
/// value is a detached copy.
pub struct ReadTxn<'a> {
    engine: &'a Engine,
    now: u64,
}

impl ReadTxn<'_> {
    /// Point lookup. Returns `(tag, value)` for a live entry.
    pub fn get(&self, key: &[u8]) -> Option<(u8, Vec<u8>)> {
        let table = self.engine.table.read();
        table
            .get(key)
            .filter(|slot| !slot.expired(self.now))
            .map(|slot| (slot.tag, slot.value.as_ref().clone()))
    }

    /// Full scan over live entries with the given tag.
    pub fn scan(&self, tag: u8) -> Vec<(Vec<u8>, Vec<u8>)> {
        let table = self.engine.table.read();
        table
            .iter()
            .filter(|(_, slot)| slot.tag == tag && !slot.expired(self.now))
            .map(|(key, slot)| (key.clone(), slot.value.as_ref().clone()))
            .collect()
    }

    /// Ordered range scan over live entries with the given tag whose key
    /// starts with `prefix`. Uses the table's native ordering, not a full
    /// scan.
    pub fn scan_prefix(&self, tag: u8, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let table = self.engine.table.read();
        table
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, slot)| slot.tag == tag && !slot.expired(self.now))
            .map(|(key, slot)| (key.clone(), slot.value.as_ref().clone()))
            .collect()
    }

    /// Keys-only scan: no value copies, no deserialization.
    pub fn scan_keys(&self, tag: u8) -> Vec<Vec<u8>> {
        let table = self.engine.table.read();
        table
            .iter()
            .filter(|(_, slot)| slot.tag == tag && !slot.expired(self.now))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// Read-write transaction. Buffers writes and validates its read-set at
/// commit; dropping the transaction discards it with no visible effect.
pub struct WriteTxn<'a> {
    engine: &'a Engine,
    now: u64,
    /// Keys read, with the version observed (0 = absent).
    reads: Vec<(Vec<u8>, u64)>,
    pending: Vec<LogOp>,
}

impl WriteTxn<'_> {
    /// Point lookup that participates in conflict detection.
    pub fn get(&mut self, key: &[u8]) -> Option<(u8, Vec<u8>)> {
        let table = self.engine.table.read();
        let slot = table.get(key).filter(|slot| !slot.expired(self.now));
        self.reads
            .push((key.to_vec(), slot.map(|s| s.version).unwrap_or(0)));
        slot.map(|slot| (slot.tag, slot.value.as_ref().clone()))
    }

    /// Buffer a set with an attached tag and optional absolute expiry
    /// (epoch seconds; 0 = never).
    pub fn set(&mut self, key: &[u8], tag: u8, expires_at: u64, value: Vec<u8>) {
        self.pending.push(LogOp::Set {
            key: key.to_vec(),
            tag,
            expires_at,
            value,
        });
    }

    /// Buffer a delete. Deleting a missing key is not an error.
    pub fn delete(&mut self, key: &[u8]) {
        self.pending.push(LogOp::Delete {
            key: key.to_vec(),
        });
    }

    /// Commit the buffered operations as one atomic, durable batch.
    ///
    /// Fails with `Conflict` if any entry read by this transaction was
    /// rewritten by a concurrent committer; nothing is applied in that
    /// case.
    pub fn commit(self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut next_version = self.engine.commit.lock();

        {
            let table = self.engine.table.read();
            for (key, observed) in &self.reads {
                let current = table
                    .get(key)
                    .filter(|slot| !slot.expired(self.now))
                    .map(|slot| slot.version)
                    .unwrap_or(0);
                if current != *observed {
                    return Err(StoreError::Conflict(
                        String::from_utf8_lossy(key).into_owned(),
                    ));
                }
            }
        }

        self.engine.log.append(&self.pending)?;

        let version = *next_version;
        *next_version += 1;

        let mut table = self.engine.table.write();
        for op in self.pending {
            match op {
                LogOp::Set {
                    key,
                    tag,
                    expires_at,
                    value,
                } => {
                    table.insert(
                        key,
                        Slot {
                            tag,
                            expires_at,
                            version,
                            value: Arc::new(value),
                        },
                    );
                }
                LogOp::Delete { key } => {
                    table.remove(&key);
                }
                LogOp::Wipe => {
                    table.clear();
                }
            }
        }

        Ok(())
    }
}
