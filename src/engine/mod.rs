//! The storage engine: coordinates the WAL, the memtable and the segments.
//!
//! # Locking
//!
//! A single writer mutex serializes puts, memtable rotation, foreground
//! flushes and compaction. Readers never take it: a get clones `Arc`
//! snapshots of the active memtable, the in-flight frozen memtable and the
//! segment list out of short `RwLock` critical sections and probes them
//! outside every lock. Segment I/O always happens with no lock held.
//!
//! # Rotation
//!
//! When a put fills the memtable, the engine installs the frozen memtable
//! in the in-flight slot, swaps in a fresh one, and hands the frozen one to
//! a background flush thread. The slot keeps the frozen data readable until
//! its segment reader is installed, so an acknowledged put is always
//! observable. At most one flush runs at a time; a rotation that finds one
//! still running waits for it first.

mod compaction;
mod flush;
mod recovery;

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crate::config::Config;
use crate::error::Result;
use crate::memtable::Memtable;
use crate::sstable::SstableReader;
use crate::wal::Wal;

/// State shared with the background flush thread.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) wal: Option<Wal>,
    pub(crate) active: RwLock<Arc<Memtable>>,
    /// Frozen memtable of the in-flight flush, readable until its segment
    /// reader is installed.
    pub(crate) flushing: RwLock<Option<Arc<Memtable>>>,
    /// Segment readers, newest first.
    pub(crate) sstables: RwLock<Vec<Arc<SstableReader>>>,
    /// Set after a failed flush: records that never reached a segment must
    /// stay in the WAL for the next open's replay, so truncation stops for
    /// the life of this handle.
    pub(crate) wal_truncate_disabled: AtomicBool,
}

/// Everything owned by the writer path, guarded by one mutex.
struct WriterState {
    flush: Option<JoinHandle<Result<()>>>,
}

/// An embedded key/value store over one data directory.
pub struct Engine {
    shared: Arc<Shared>,
    writer: Mutex<WriterState>,
    closed: AtomicBool,
}

impl Engine {
    /// Opens (creating if needed) the store in `config.dir`.
    ///
    /// Recovery order: orphaned temp files are deleted, existing segments
    /// are loaded newest-first (corrupt ones logged and skipped), and the
    /// WAL is replayed into a fresh memtable.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;

        recovery::remove_orphan_temps(&config.dir)?;
        let sstables = recovery::load_sstables(&config.dir)?;

        let memtable = Memtable::new();
        let wal = if config.wal_enabled {
            let wal = Wal::open(config.wal_path())?;
            let mut replayed = 0usize;
            for (key, value) in wal.replay()? {
                memtable.insert(key, value);
                replayed += 1;
            }
            if replayed > 0 {
                tracing::info!(records = replayed, "replayed wal into memtable");
            }
            Some(wal)
        } else {
            None
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                wal,
                active: RwLock::new(Arc::new(memtable)),
                flushing: RwLock::new(None),
                sstables: RwLock::new(sstables),
                wal_truncate_disabled: AtomicBool::new(false),
            }),
            writer: Mutex::new(WriterState { flush: None }),
            closed: AtomicBool::new(false),
        })
    }

    /// Stores a key-value pair. The record is durable in the WAL before
    /// this returns; a rotation triggered by a full memtable hands the
    /// frozen memtable to a background flush without waiting for it.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();

        if let Some(wal) = &self.shared.wal {
            wal.append(key, value)?;
        }

        let active = self.shared.active.read().unwrap().clone();
        active.insert(key.to_vec(), value.to_vec());

        if active.is_full(self.shared.config.memtable_max_bytes) {
            // At most one flush at a time: a rotation that finds one still
            // running waits for it before taking the in-flight slot.
            Self::join_flush(&mut writer);
            // The record is already durable and inserted, so a failure past
            // this point belongs to the flush pipeline, never to this put.
            // A failed rotation leaves the memtable full for the next put
            // to retry; a failed spawn leaves the frozen memtable covered
            // by the retained WAL until the next open replays it.
            match self.rotate() {
                Ok((frozen, mark)) => match flush::spawn(self.shared.clone(), frozen, mark) {
                    Ok(handle) => writer.flush = Some(handle),
                    Err(e) => {
                        self.shared.wal_truncate_disabled.store(true, Ordering::SeqCst);
                        tracing::error!(error = %e, "failed to spawn flush thread, wal retained");
                    }
                },
                Err(e) => tracing::error!(error = %e, "memtable rotation failed"),
            }
        }
        Ok(())
    }

    /// Retrieves the value for a key, probing the active memtable, then the
    /// in-flight frozen memtable, then each segment newest to oldest.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let active = self.shared.active.read().unwrap().clone();
        if let Some(value) = active.get(key) {
            return Ok(Some(value));
        }

        let flushing = self.shared.flushing.read().unwrap().clone();
        if let Some(frozen) = flushing {
            if let Some(value) = frozen.get(key) {
                return Ok(Some(value));
            }
        }

        let sstables = self.shared.sstables.read().unwrap().clone();
        for table in sstables {
            if let Some(value) = table.get(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Waits for any in-flight flush, then flushes the current memtable
    /// synchronously. On return every acknowledged put is in a segment.
    pub fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        self.flush_locked(&mut writer)
    }

    /// Merges all segments into one, removing shadowed records, then
    /// deletes the replaced files. A failure leaves the existing segment
    /// set untouched.
    pub fn compact(&self) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        self.flush_locked(&mut writer)?;
        compaction::run(&self.shared)
    }

    /// Flushes outstanding writes and releases the WAL.
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn flush_locked(&self, writer: &mut WriterState) -> Result<()> {
        Self::join_flush(writer);
        let (frozen, mark) = self.rotate()?;
        flush::run(&self.shared, &frozen, mark)
    }

    /// Installs a fresh active memtable, parking the previous one in the
    /// in-flight slot. Returns the frozen memtable and the WAL length at
    /// the rotation point; only bytes before that mark may be discarded
    /// once the segment exists. Caller holds the writer mutex.
    fn rotate(&self) -> Result<(Arc<Memtable>, u64)> {
        let mark = match &self.shared.wal {
            Some(wal) => wal.position()?,
            None => 0,
        };

        let mut flushing = self.shared.flushing.write().unwrap();
        let mut active = self.shared.active.write().unwrap();
        let frozen = std::mem::replace(&mut *active, Arc::new(Memtable::new()));
        *flushing = Some(frozen.clone());

        Ok((frozen, mark))
    }

    fn join_flush(writer: &mut WriterState) {
        if let Some(handle) = writer.flush.take() {
            // The flush thread logs its own failures; the WAL is preserved
            // for replay, so there is nothing to surface here.
            if handle.join().is_err() {
                tracing::error!("background flush thread panicked");
            }
        }
    }

    fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut writer = self.writer.lock().unwrap();
        let flushed = self.flush_locked(&mut writer);
        if let Some(wal) = &self.shared.wal {
            wal.close()?;
        }
        flushed
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "engine shutdown during drop failed");
        }
    }
}
