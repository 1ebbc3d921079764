//! Framed, checksummed commit log.
//!
//! Every committed transaction is appended as one frame:
//! `len u32 LE | rmp(Vec<LogOp>) | crc32 u32 LE`. A frame is the unit of
//! atomicity: on replay, an incomplete or corrupt tail frame is truncated
//! away, so a crash mid-commit leaves no partial state visible.

use crate::error::{Result, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the commit log.
const LOG_MAGIC: &[u8; 4] = b"EDB\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Header size: magic + version.
const HEADER_SIZE: u64 = 5;

/// Sanity cap on a single frame (100MB).
const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// A single logged operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LogOp {
    Set {
        key: Vec<u8>,
        tag: u8,
        /// Absolute expiry in epoch seconds; 0 = never.
        expires_at: u64,
        value: Vec<u8>,
    },
    Delete {
        key: Vec<u8>,
    },
    /// Full-store wipe marker.
    Wipe,
}

struct LogWriter {
    writer: BufWriter<File>,
    writes_since_sync: u64,
}

/// Append-only commit log.
pub struct CommitLog {
    path: PathBuf,
    inner: Mutex<LogWriter>,
    /// Sync every N commits; 1 = every commit.
    sync_interval: u64,
}

impl CommitLog {
    /// Open or create the log, replaying existing frames through `apply`.
    ///
    /// A torn tail frame (crash during append) is truncated. A checksum
    /// mismatch on a complete frame is reported as corruption.
    pub fn open<F>(path: impl AsRef<Path>, sync_interval: u64, mut apply: F) -> Result<Self>
    where
        F: FnMut(Vec<LogOp>),
    {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.write_all(LOG_MAGIC)?;
            file.write_all(&[LOG_VERSION])?;
            file.sync_all()?;
        } else {
            let file = File::open(&path)?;
            let mut reader = BufReader::new(file);

            let mut magic = [0u8; 4];
            reader.read_exact(&mut magic)?;
            if &magic != LOG_MAGIC {
                return Err(StoreError::InvalidFormat("invalid commit log magic".into()));
            }

            let mut version = [0u8; 1];
            reader.read_exact(&mut version)?;
            if version[0] != LOG_VERSION {
                return Err(StoreError::InvalidFormat(format!(
                    "unsupported commit log version: {}",
                    version[0]
                )));
            }

            let mut good_end = HEADER_SIZE;
            loop {
                match Self::read_frame(&mut reader) {
                    Ok(Some((batch, frame_len))) => {
                        apply(batch);
                        good_end += frame_len;
                    }
                    Ok(None) => break,
                    Err(StoreError::Corruption(msg)) => {
                        return Err(StoreError::Corruption(msg));
                    }
                    Err(StoreError::ChecksumMismatch { expected, got }) => {
                        return Err(StoreError::ChecksumMismatch { expected, got });
                    }
                    // Incomplete tail frame: crash during append.
                    Err(_) => {
                        tracing::warn!(
                            path = %path.display(),
                            offset = good_end,
                            "truncating torn tail frame in commit log"
                        );
                        break;
                    }
                }
            }

            drop(reader);
            let file = OpenOptions::new().write(true).open(&path)?;
            if file.metadata()?.len() > good_end {
                file.set_len(good_end)?;
                file.sync_all()?;
            }
        }

        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(LogWriter {
                writer: BufWriter::new(file),
                writes_since_sync: 0,
            }),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Append one atomic batch.
    pub fn append(&self, batch: &[LogOp]) -> Result<()> {
        let encoded = rmp_serde::to_vec(batch)?;
        let checksum = crc32fast::hash(&encoded);

        let mut inner = self.inner.lock();
        inner.writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        inner.writer.write_all(&encoded)?;
        inner.writer.write_all(&checksum.to_le_bytes())?;
        inner.writer.flush()?;

        inner.writes_since_sync += 1;
        if inner.writes_since_sync >= self.sync_interval {
            inner.writer.get_ref().sync_all()?;
            inner.writes_since_sync = 0;
        }

        Ok(())
    }

    /// Force pending writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        inner.writes_since_sync = 0;
        Ok(())
    }

    /// Truncate the log back to an empty header.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(LOG_MAGIC)?;
        file.write_all(&[LOG_VERSION])?;
        file.sync_all()?;

        inner.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        inner.writes_since_sync = 0;
        Ok(())
    }

    /// Atomically replace the log contents with the given batches
    /// (compaction). Writes to a sibling temp file, then renames over.
    pub fn rewrite(&self, batches: &[Vec<LogOp>]) -> Result<()> {
        let mut inner = self.inner.lock();

        let tmp_path = self.path.with_extension("log.tmp");
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(LOG_MAGIC)?;
            writer.write_all(&[LOG_VERSION])?;

            for batch in batches {
                let encoded = rmp_serde::to_vec(batch)?;
                let checksum = crc32fast::hash(&encoded);
                writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
                writer.write_all(&encoded)?;
                writer.write_all(&checksum.to_le_bytes())?;
            }

            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        std::fs::rename(&tmp_path, &self.path)?;

        inner.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        inner.writes_since_sync = 0;
        Ok(())
    }

    /// Read one frame; `Ok(None)` at clean EOF. The returned length is the
    /// total frame size including prefix and checksum.
    fn read_frame(reader: &mut BufReader<File>) -> Result<Option<(Vec<LogOp>, u64)>> {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Distinguish clean EOF from a torn length prefix.
                return if reader.stream_position()? == reader.get_ref().metadata()?.len() {
                    Ok(None)
                } else {
                    Err(StoreError::Io(e))
                };
            }
            Err(e) => return Err(StoreError::Io(e)),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(StoreError::Corruption("commit log frame too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);

        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(StoreError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        let batch: Vec<LogOp> = rmp_serde::from_slice(&encoded)?;
        Ok(Some((batch, 4 + len as u64 + 4)))
    }
}
