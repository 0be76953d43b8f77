//! Writing a frozen memtable out as a segment.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::Shared;
use crate::error::Result;
use crate::memtable::Memtable;
use crate::sstable::{SstableReader, SstableWriter};

/// Spawns the background flush for a rotated memtable. Failures are logged
/// here; the records stay in the WAL, so they are recovered at the next
/// open.
pub(super) fn spawn(
    shared: Arc<Shared>,
    frozen: Arc<Memtable>,
    wal_mark: u64,
) -> Result<JoinHandle<Result<()>>> {
    let handle = std::thread::Builder::new()
        .name("cinderdb-flush".to_string())
        .spawn(move || {
            let result = run(&shared, &frozen, wal_mark);
            if let Err(e) = &result {
                tracing::error!(error = %e, "background flush failed, wal retained");
            }
            result
        })?;
    Ok(handle)
}

/// Flushes one frozen memtable: write the segment, install its reader at
/// the front of the segment list, release the in-flight slot, then discard
/// the WAL records before the rotation mark.
pub(super) fn run(shared: &Shared, frozen: &Arc<Memtable>, wal_mark: u64) -> Result<()> {
    let result = write_and_install(shared, frozen, wal_mark);
    if result.is_err() {
        // Whatever did not reach a segment must stay replayable, so no
        // later flush may truncate the log.
        shared.wal_truncate_disabled.store(true, Ordering::SeqCst);
    }
    result
}

fn write_and_install(shared: &Shared, frozen: &Arc<Memtable>, wal_mark: u64) -> Result<()> {
    if frozen.is_empty() {
        *shared.flushing.write().unwrap() = None;
        return Ok(());
    }

    let mut writer = SstableWriter::create(&shared.config.dir)?;
    for (key, value) in frozen.iter() {
        writer.add(&key, &value)?;
    }
    let path = writer.finish()?;
    let reader = Arc::new(SstableReader::open(&path)?);

    // Install before releasing the slot: a reader must find the data in
    // one place or the other at every instant.
    shared.sstables.write().unwrap().insert(0, reader);
    *shared.flushing.write().unwrap() = None;

    tracing::info!(
        segment = %path.display(),
        entries = frozen.len(),
        "flushed memtable to segment"
    );

    if let Some(wal) = &shared.wal {
        if shared.wal_truncate_disabled.load(Ordering::SeqCst) {
            tracing::warn!("wal truncation disabled by an earlier failure, log retained");
        } else {
            wal.truncate_to(wal_mark)?;
        }
    }
    Ok(())
}
