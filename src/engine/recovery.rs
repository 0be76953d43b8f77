//! Startup recovery: directory cleanup and segment loading.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::config::WAL_FILE;
use crate::error::{Error, Result};
use crate::sstable::{self, SstableReader};
use crate::wal::Wal;

/// Deletes temp files orphaned by a crash mid-write. A `.tmp` never holds
/// the only copy of anything: segment temps are renamed before their data
/// leaves the WAL, and the WAL temp is renamed before the old log is
/// touched.
pub(super) fn remove_orphan_temps(dir: &Path) -> Result<()> {
    let wal_tmp = Wal::truncate_tmp_path(&dir.join(WAL_FILE));
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        let orphan = (name.starts_with(sstable::FILE_PREFIX) && name.ends_with(sstable::TMP_SUFFIX))
            || entry.path() == wal_tmp;
        if orphan {
            match fs::remove_file(entry.path()) {
                Ok(()) => tracing::info!(file = name, "removed orphaned temp file"),
                Err(e) => tracing::warn!(file = name, error = %e, "failed to remove temp file"),
            }
        }
    }
    Ok(())
}

/// Loads every segment in the directory, newest first. The timestamped
/// naming scheme makes filename order creation order. Files that fail to
/// open are logged and skipped so one corrupt segment does not take the
/// store down.
pub(super) fn load_sstables(dir: &Path) -> Result<Vec<Arc<SstableReader>>> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| sstable::is_segment_file_name(name))
        .collect();
    names.sort_unstable_by(|a, b| b.cmp(a));

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let path = dir.join(&name);
        match SstableReader::open(&path) {
            Ok(reader) => tables.push(Arc::new(reader)),
            Err(Error::CorruptSegment { reason, .. }) => {
                tracing::warn!(segment = %name, %reason, "skipping corrupt segment");
            }
            Err(e) => {
                tracing::warn!(segment = %name, error = %e, "skipping unreadable segment");
            }
        }
    }

    tracing::debug!(segments = tables.len(), "loaded segments");
    Ok(tables)
}
