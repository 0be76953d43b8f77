//! Write-ahead log.
//!
//! Every accepted put is appended here and synced to storage before the
//! engine acknowledges it, making the active memtable reconstructible after
//! a crash.
//!
//! # File format
//!
//! A bare concatenation of records, no header, no terminator:
//!
//! ```text
//! +-----------+-------+-----------+-------+
//! |key_len:i32| key   |val_len:i32| value |
//! +-----------+-------+-----------+-------+
//! |  4 bytes  |var len|  4 bytes  |var len|
//! +-----------+-------+-----------+-------+
//! ```
//!
//! Integers are little-endian. A torn tail, left by a crash mid-append, is
//! detected by replay and silently discarded.
//!
//! All handle state lives behind one mutex, so appends are serialized and
//! truncation and close are mutually exclusive with each other and with any
//! append.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;

pub struct Wal {
    path: PathBuf,
    // None once closed.
    file: Mutex<Option<File>>,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal").field("path", &self.path).finish()
    }
}

impl Wal {
    /// Opens (creating if absent) the log at `path` for appending.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = Self::open_append(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    fn open_append(path: &Path) -> Result<File> {
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }

    /// Temp path the truncation rewrite of the log at `path` goes through.
    /// Startup cleanup deletes an orphan left here by a crash mid-rewrite.
    pub(crate) fn truncate_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("log.tmp")
    }

    /// Appends one record and syncs it to storage before returning.
    pub fn append(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(8 + key.len() + value.len());
        payload.write_i32::<LittleEndian>(key.len() as i32)?;
        payload.extend_from_slice(key);
        payload.write_i32::<LittleEndian>(value.len() as i32)?;
        payload.extend_from_slice(value);

        let mut guard = self.file.lock().unwrap();
        let file = guard.as_mut().ok_or_else(Self::closed)?;
        file.write_all(&payload)?;
        file.sync_data()?;
        Ok(())
    }

    /// Current length of the log in bytes. Appends are synced one record at
    /// a time, so this always falls on a record boundary.
    pub fn position(&self) -> Result<u64> {
        let mut guard = self.file.lock().unwrap();
        let file = guard.as_mut().ok_or_else(Self::closed)?;
        Ok(file.metadata()?.len())
    }

    /// Discards every record before `keep_from` and reopens the append
    /// handle.
    ///
    /// The surviving tail holds the records of the current active memtable,
    /// which have not been written to any segment yet. The rewrite goes
    /// through a temp file and a rename so a crash mid-truncation leaves
    /// either the old log or the new one, never a partial file.
    pub fn truncate_to(&self, keep_from: u64) -> Result<()> {
        let mut guard = self.file.lock().unwrap();
        let file = guard.as_mut().ok_or_else(Self::closed)?;

        let len = file.metadata()?.len();
        let tail = if keep_from < len {
            let mut reader = File::open(&self.path)?;
            std::io::Seek::seek(&mut reader, std::io::SeekFrom::Start(keep_from))?;
            let mut tail = Vec::with_capacity((len - keep_from) as usize);
            reader.read_to_end(&mut tail)?;
            tail
        } else {
            Vec::new()
        };

        let tmp_path = Self::truncate_tmp_path(&self.path);
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&tail)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        *guard = Some(Self::open_append(&self.path)?);
        Ok(())
    }

    /// Syncs and closes the append handle. Later appends fail.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.file.lock().unwrap();
        if let Some(file) = guard.take() {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Replays the log from disk, yielding every well-formed record in file
    /// order. A missing file replays as empty.
    pub fn replay(&self) -> Result<ReplayIterator> {
        ReplayIterator::open(&self.path)
    }

    fn closed() -> std::io::Error {
        std::io::Error::new(ErrorKind::Other, "wal is closed")
    }
}

/// Iterator over the records of a WAL file.
///
/// A torn tail (a record cut short by a crash) ends iteration cleanly; any
/// other read error is logged and ends iteration at that point. Neither is
/// surfaced to the caller.
pub struct ReplayIterator {
    reader: Option<BufReader<File>>,
    remaining: u64,
}

impl ReplayIterator {
    fn open(path: &Path) -> Result<Self> {
        match File::open(path) {
            Ok(file) => {
                let remaining = file.metadata()?.len();
                Ok(Self {
                    reader: Some(BufReader::new(file)),
                    remaining,
                })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self {
                reader: None,
                remaining: 0,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads one field length, checking it fits in the bytes left.
    fn read_len(&mut self) -> Option<usize> {
        let reader = self.reader.as_mut()?;
        if self.remaining < 4 {
            if self.remaining > 0 {
                tracing::debug!(trailing = self.remaining, "discarding torn wal tail");
            }
            return None;
        }
        match reader.read_i32::<LittleEndian>() {
            Ok(len) if len >= 0 => {
                self.remaining -= 4;
                let len = len as u64;
                if len > self.remaining {
                    tracing::debug!(needed = len, left = self.remaining, "discarding torn wal tail");
                    return None;
                }
                Some(len as usize)
            }
            Ok(len) => {
                tracing::warn!(len, "negative length in wal, stopping replay");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "wal read failed, stopping replay");
                None
            }
        }
    }

    fn read_bytes(&mut self, len: usize) -> Option<Vec<u8>> {
        let reader = self.reader.as_mut()?;
        let mut buf = vec![0u8; len];
        match reader.read_exact(&mut buf) {
            Ok(()) => {
                self.remaining -= len as u64;
                Some(buf)
            }
            Err(e) => {
                tracing::warn!(error = %e, "wal read failed, stopping replay");
                None
            }
        }
    }
}

impl Iterator for ReplayIterator {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let key_len = self.read_len()?;
        let key = self.read_bytes(key_len)?;
        let value_len = self.read_len()?;
        let value = self.read_bytes(value_len)?;
        Some((key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn open_wal(dir: &TempDir) -> Wal {
        Wal::open(dir.path().join("wal.log")).expect("failed to open wal")
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(&dir);

        wal.append(b"key1", b"value1").unwrap();
        wal.append(b"key2", b"value2").unwrap();
        wal.append(b"key1", b"value3").unwrap();

        let entries: Vec<_> = wal.replay().unwrap().collect();
        assert_eq!(
            entries,
            vec![
                (b"key1".to_vec(), b"value1".to_vec()),
                (b"key2".to_vec(), b"value2".to_vec()),
                (b"key1".to_vec(), b"value3".to_vec()),
            ]
        );
    }

    #[test]
    fn test_replay_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let iter = ReplayIterator::open(&dir.path().join("absent.log")).unwrap();
        assert_eq!(iter.count(), 0);
    }

    #[test]
    fn test_empty_values_and_keys() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(&dir);

        wal.append(b"", b"value").unwrap();
        wal.append(b"key", b"").unwrap();

        let entries: Vec<_> = wal.replay().unwrap().collect();
        assert_eq!(entries[0], (b"".to_vec(), b"value".to_vec()));
        assert_eq!(entries[1], (b"key".to_vec(), b"".to_vec()));
    }

    #[test]
    fn test_torn_tail_discarded_at_every_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");

        let wal = Wal::open(&path).unwrap();
        wal.append(b"alpha", b"1").unwrap();
        let complete = wal.position().unwrap();
        wal.append(b"beta", b"2").unwrap();
        let full = wal.position().unwrap();
        wal.close().unwrap();

        // Truncate the second record to every possible partial length; the
        // first record must always survive and the torn one must vanish.
        for cut in complete..full {
            std::fs::copy(&path, dir.path().join("scratch.log")).unwrap();

            let scratch = OpenOptions::new()
                .write(true)
                .open(dir.path().join("scratch.log"))
                .unwrap();
            scratch.set_len(cut).unwrap();
            drop(scratch);

            let entries: Vec<_> = ReplayIterator::open(&dir.path().join("scratch.log"))
                .unwrap()
                .collect();
            assert_eq!(entries, vec![(b"alpha".to_vec(), b"1".to_vec())], "cut at {cut}");
        }
    }

    #[test]
    fn test_trailing_garbage_bytes_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");

        let wal = Wal::open(&path).unwrap();
        wal.append(b"p", b"q").unwrap();
        wal.close().unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x00, 0x00]).unwrap();
        drop(file);

        let entries: Vec<_> = ReplayIterator::open(&path).unwrap().collect();
        assert_eq!(entries, vec![(b"p".to_vec(), b"q".to_vec())]);
    }

    #[test]
    fn test_truncate_to_keeps_tail() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(&dir);

        wal.append(b"old1", b"1").unwrap();
        wal.append(b"old2", b"2").unwrap();
        let mark = wal.position().unwrap();
        wal.append(b"new", b"3").unwrap();

        wal.truncate_to(mark).unwrap();

        let entries: Vec<_> = wal.replay().unwrap().collect();
        assert_eq!(entries, vec![(b"new".to_vec(), b"3".to_vec())]);

        // The reopened handle keeps appending after the surviving tail.
        wal.append(b"later", b"4").unwrap();
        let entries: Vec<_> = wal.replay().unwrap().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], (b"later".to_vec(), b"4".to_vec()));
    }

    #[test]
    fn test_truncate_to_end_empties_log() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(&dir);

        wal.append(b"key", b"value").unwrap();
        let mark = wal.position().unwrap();
        wal.truncate_to(mark).unwrap();

        assert_eq!(wal.position().unwrap(), 0);
        assert_eq!(wal.replay().unwrap().count(), 0);
    }

    #[test]
    fn test_append_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let wal = open_wal(&dir);
        wal.close().unwrap();
        assert!(wal.append(b"key", b"value").is_err());
    }
}
