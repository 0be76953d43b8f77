//! Full-merge compaction: all segments become one.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use super::Shared;
use crate::error::Result;
use crate::sstable::{SstableReader, SstableWriter};

/// Merges every segment into a single new one, dropping shadowed records,
/// then deletes the replaced files.
///
/// The caller holds the writer mutex and has already flushed, so the
/// segment list cannot change underneath the merge. Readers keep serving
/// from the old list until the single swap below; in-flight lookups hold
/// their own `Arc` on the readers they probe, which keeps a replaced
/// segment alive past its deletion from the directory.
pub(super) fn run(shared: &Shared) -> Result<()> {
    let old: Vec<Arc<SstableReader>> = shared.sstables.read().unwrap().clone();
    if old.len() < 2 {
        return Ok(());
    }

    // Oldest first, so newer segments overwrite on key collisions.
    let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    for table in old.iter().rev() {
        for record in table.iter()? {
            let (key, value) = record?;
            merged.insert(key, value);
        }
    }

    let mut replacement = Vec::with_capacity(1);
    if !merged.is_empty() {
        let mut writer = SstableWriter::create(&shared.config.dir)?;
        for (key, value) in &merged {
            writer.add(key, value)?;
        }
        let path = writer.finish()?;
        replacement.push(Arc::new(SstableReader::open(&path)?));

        tracing::info!(
            segment = %path.display(),
            merged_segments = old.len(),
            entries = merged.len(),
            "compacted segments"
        );
    }

    *shared.sstables.write().unwrap() = replacement;

    // Nothing readable points at the old files anymore; their deletion is
    // cleanup, not correctness.
    for table in old {
        if let Err(e) = fs::remove_file(table.path()) {
            tracing::warn!(
                segment = %table.path().display(),
                error = %e,
                "failed to delete replaced segment"
            );
        }
    }
    Ok(())
}
