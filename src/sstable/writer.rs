//! Segment construction.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};

use super::{FILE_PREFIX, FILE_SUFFIX, HEADER_LEN, MAGIC, SPARSE_INDEX_STRIDE, TMP_SUFFIX, VERSION};
use crate::error::Result;

/// Writes one segment file from records supplied in ascending key order.
///
/// The writer streams records to a timestamped `.tmp` path while collecting
/// sparse-index entries, then [`finish`](Self::finish) writes the index,
/// rewrites the header counts, syncs, and renames the file into place. If
/// the writer is dropped or fails before that, the temp file is removed and
/// no final path ever appears.
pub struct SstableWriter {
    file: BufWriter<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    offset: u64,
    entry_count: u32,
    index: Vec<(Vec<u8>, u64)>,
    finished: bool,
}

impl SstableWriter {
    /// Opens a writer on a fresh timestamped temp file in `dir`.
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;

        // Flushes are serialized, but two may still land on the same
        // millisecond stamp; wait the stamp out rather than clobber.
        let (tmp_path, final_path) = loop {
            let stamp = super::timestamp_now();
            let final_path = dir.join(format!("{FILE_PREFIX}{stamp}{FILE_SUFFIX}"));
            if !final_path.exists() {
                let tmp_path = dir.join(format!("{FILE_PREFIX}{stamp}{TMP_SUFFIX}"));
                break (tmp_path, final_path);
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        };

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        let mut file = BufWriter::new(file);

        // Placeholder header; the counts and index offset are rewritten by
        // finish() once they are known.
        file.write_u32::<LittleEndian>(MAGIC)?;
        file.write_u32::<LittleEndian>(VERSION)?;
        file.write_u32::<LittleEndian>(0)?;
        file.write_u32::<LittleEndian>(0)?;
        file.write_u64::<LittleEndian>(0)?;

        Ok(Self {
            file,
            tmp_path,
            final_path,
            offset: HEADER_LEN,
            entry_count: 0,
            index: Vec::new(),
            finished: false,
        })
    }

    /// Appends one record. Keys must arrive in strictly ascending order;
    /// every [`SPARSE_INDEX_STRIDE`]th record is indexed, starting with the
    /// first.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.entry_count as usize % SPARSE_INDEX_STRIDE == 0 {
            self.index.push((key.to_vec(), self.offset));
        }

        self.file.write_i32::<LittleEndian>(key.len() as i32)?;
        self.file.write_all(key)?;
        self.file.write_i32::<LittleEndian>(value.len() as i32)?;
        self.file.write_all(value)?;

        self.offset += 8 + key.len() as u64 + value.len() as u64;
        self.entry_count += 1;
        Ok(())
    }

    /// Number of records added so far.
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    /// Writes the sparse index, completes the header, syncs the file to
    /// storage and renames it to its final `.sst` path.
    pub fn finish(mut self) -> Result<PathBuf> {
        let index_offset = self.offset;
        for (key, offset) in &self.index {
            self.file.write_i32::<LittleEndian>(key.len() as i32)?;
            self.file.write_all(key)?;
            self.file.write_i64::<LittleEndian>(*offset as i64)?;
        }

        self.file.seek(SeekFrom::Start(8))?;
        self.file.write_u32::<LittleEndian>(self.entry_count)?;
        self.file.write_u32::<LittleEndian>(self.index.len() as u32)?;
        self.file.write_u64::<LittleEndian>(index_offset)?;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        fs::rename(&self.tmp_path, &self.final_path)?;

        self.finished = true;
        Ok(self.final_path.clone())
    }
}

impl Drop for SstableWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}
