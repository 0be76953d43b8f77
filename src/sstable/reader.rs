//! Segment lookups.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};

use super::{HEADER_LEN, MAGIC, VERSION};
use crate::error::{Error, Result};

/// Read handle over one immutable segment file.
///
/// The header is validated and the sparse index loaded once at open; after
/// that the reader never mutates and is safe to share across threads. Each
/// lookup opens its own short-lived read handle, so concurrent lookups do
/// not contend on a file cursor.
#[derive(Debug)]
pub struct SstableReader {
    path: PathBuf,
    entry_count: u32,
    /// Sparse (key, record offset) pairs in ascending key order.
    index: Vec<(Vec<u8>, u64)>,
    /// Where the data section ends and the index section begins.
    index_offset: u64,
}

impl SstableReader {
    /// Opens a segment, validating the header and loading the sparse index.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        if file_len < HEADER_LEN {
            return Err(Error::corrupt(&path, "file shorter than header"));
        }

        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(Error::corrupt(&path, format!("bad magic 0x{magic:08x}")));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version > VERSION {
            return Err(Error::corrupt(&path, format!("unsupported version {version}")));
        }
        let entry_count = reader.read_u32::<LittleEndian>()?;
        let index_entry_count = reader.read_u32::<LittleEndian>()?;
        let index_offset = reader.read_u64::<LittleEndian>()?;

        if index_offset > file_len {
            return Err(Error::corrupt(&path, "index offset beyond file end"));
        }
        if index_offset < HEADER_LEN {
            return Err(Error::corrupt(&path, "index offset inside header"));
        }
        if index_entry_count == 0 && entry_count > 0 {
            return Err(Error::corrupt(&path, "missing sparse index"));
        }

        reader.seek(SeekFrom::Start(index_offset))?;
        let mut index = Vec::with_capacity(index_entry_count as usize);
        let mut pos = index_offset;
        let mut prev_offset = None;
        for _ in 0..index_entry_count {
            if pos + 4 > file_len {
                return Err(Error::corrupt(&path, "index entry overruns file"));
            }
            let key_len = reader.read_i32::<LittleEndian>()?;
            if key_len < 0 {
                return Err(Error::corrupt(&path, "negative index key length"));
            }
            pos += 4;
            if pos + key_len as u64 + 8 > file_len {
                return Err(Error::corrupt(&path, "index entry overruns file"));
            }
            let mut key = vec![0u8; key_len as usize];
            reader.read_exact(&mut key)?;
            pos += key_len as u64;

            let offset = reader.read_i64::<LittleEndian>()?;
            pos += 8;
            if offset < 0 {
                return Err(Error::corrupt(&path, "negative index offset"));
            }
            let offset = offset as u64;
            if !(HEADER_LEN..index_offset).contains(&offset) {
                return Err(Error::corrupt(&path, "index offset outside data section"));
            }
            if prev_offset.is_some_and(|prev| offset <= prev) {
                return Err(Error::corrupt(&path, "index offsets not strictly increasing"));
            }
            prev_offset = Some(offset);

            index.push((key, offset));
        }

        Ok(Self {
            path,
            entry_count,
            index,
            index_offset,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    /// Looks up one key: binary search in the sparse index, then a linear
    /// scan of the record window it bounds (at most one stride of records).
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.index.is_empty() {
            return Ok(None);
        }

        let (start, end) = match self
            .index
            .binary_search_by(|(indexed, _)| indexed.as_slice().cmp(key))
        {
            Ok(i) => (self.index[i].1, self.window_end(i + 1)),
            // An insertion point of zero means the key sorts before the
            // first record of the segment.
            Err(0) => return Ok(None),
            Err(p) => (self.index[p - 1].1, self.window_end(p)),
        };

        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(start))?;

        let mut pos = start;
        while pos < end {
            let (record_key, value_len) = self.read_record_head(&mut reader, &mut pos)?;
            if record_key == key {
                let mut value = vec![0u8; value_len];
                reader.read_exact(&mut value)?;
                return Ok(Some(value));
            }
            reader.seek(SeekFrom::Current(value_len as i64))?;
            pos += value_len as u64;
        }
        Ok(None)
    }

    fn window_end(&self, next_index_slot: usize) -> u64 {
        self.index
            .get(next_index_slot)
            .map(|(_, offset)| *offset)
            .unwrap_or(self.index_offset)
    }

    /// Reads a record's key and value length, leaving the reader positioned
    /// at the value bytes. `pos` is advanced past them too.
    fn read_record_head(
        &self,
        reader: &mut BufReader<File>,
        pos: &mut u64,
    ) -> Result<(Vec<u8>, usize)> {
        let key_len = reader.read_i32::<LittleEndian>()?;
        if key_len < 0 || *pos + 4 + key_len as u64 > self.index_offset {
            return Err(Error::corrupt(&self.path, "record key overruns data section"));
        }
        let mut key = vec![0u8; key_len as usize];
        reader.read_exact(&mut key)?;
        *pos += 4 + key_len as u64;

        let value_len = reader.read_i32::<LittleEndian>()?;
        if value_len < 0 || *pos + 4 + value_len as u64 > self.index_offset {
            return Err(Error::corrupt(&self.path, "record value overruns data section"));
        }
        *pos += 4;

        Ok((key, value_len as usize))
    }

    /// Sequential scan of the whole data section, used by compaction.
    pub fn iter(&self) -> Result<SstableIterator<'_>> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(HEADER_LEN))?;
        Ok(SstableIterator {
            table: self,
            reader,
            pos: HEADER_LEN,
        })
    }

    #[cfg(test)]
    pub(crate) fn index_keys(&self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.index.iter().map(|(key, _)| key.clone())
    }
}

/// Iterates all records of a segment in key order.
pub struct SstableIterator<'a> {
    table: &'a SstableReader,
    reader: BufReader<File>,
    pos: u64,
}

impl Iterator for SstableIterator<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.table.index_offset {
            return None;
        }
        let (key, value_len) = match self.table.read_record_head(&mut self.reader, &mut self.pos) {
            Ok(head) => head,
            Err(e) => return Some(Err(e)),
        };
        let mut value = vec![0u8; value_len];
        if let Err(e) = self.reader.read_exact(&mut value) {
            return Some(Err(e.into()));
        }
        self.pos += value_len as u64;
        Some(Ok((key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::SstableWriter;
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;
    use tempfile::TempDir;

    fn build_segment(dir: &Path, count: usize) -> PathBuf {
        let mut writer = SstableWriter::create(dir).unwrap();
        for i in 0..count {
            let key = format!("key{i:04}");
            let value = format!("value{i}");
            writer.add(key.as_bytes(), value.as_bytes()).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_lookup_every_key() {
        let dir = TempDir::new().unwrap();
        // Spans several stride windows plus a partial tail.
        let path = build_segment(dir.path(), 50);
        let reader = SstableReader::open(&path).unwrap();

        assert_eq!(reader.entry_count(), 50);
        for i in 0..50 {
            let key = format!("key{i:04}");
            let value = reader.get(key.as_bytes()).unwrap();
            assert_eq!(value, Some(format!("value{i}").into_bytes()), "key {key}");
        }
    }

    #[test]
    fn test_lookup_absent_keys() {
        let dir = TempDir::new().unwrap();
        let path = build_segment(dir.path(), 50);
        let reader = SstableReader::open(&path).unwrap();

        // Before the first key, between keys, and after the last key.
        assert_eq!(reader.get(b"aaa").unwrap(), None);
        assert_eq!(reader.get(b"key0010x").unwrap(), None);
        assert_eq!(reader.get(b"key9999").unwrap(), None);
    }

    #[test]
    fn test_iter_yields_sorted_records() {
        let dir = TempDir::new().unwrap();
        let path = build_segment(dir.path(), 37);
        let reader = SstableReader::open(&path).unwrap();

        let records: Result<Vec<_>> = reader.iter().unwrap().collect();
        let records = records.unwrap();
        assert_eq!(records.len(), 37);
        for pair in records.windows(2) {
            assert!(pair[0].0 < pair[1].0, "keys out of order");
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sstable_20240101_000000_000.sst");
        let mut file = File::create(&path).unwrap();
        file.write_u32::<LittleEndian>(0xdead_beef).unwrap();
        file.write_all(&[0u8; 20]).unwrap();
        drop(file);

        assert!(matches!(
            SstableReader::open(&path),
            Err(Error::CorruptSegment { .. })
        ));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sstable_20240101_000000_000.sst");
        let mut file = File::create(&path).unwrap();
        file.write_u32::<LittleEndian>(MAGIC).unwrap();
        file.write_u32::<LittleEndian>(VERSION + 1).unwrap();
        file.write_all(&[0u8; 16]).unwrap();
        drop(file);

        assert!(matches!(
            SstableReader::open(&path),
            Err(Error::CorruptSegment { .. })
        ));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sstable_20240101_000000_000.sst");
        std::fs::write(&path, b"SSTB").unwrap();

        assert!(matches!(
            SstableReader::open(&path),
            Err(Error::CorruptSegment { .. })
        ));
    }

    #[test]
    fn test_index_offset_beyond_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = build_segment(dir.path(), 5);

        // Point the index offset past the end of the file.
        let mut bytes = std::fs::read(&path).unwrap();
        let bogus = (bytes.len() as u64 + 100).to_le_bytes();
        bytes[16..24].copy_from_slice(&bogus);
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            SstableReader::open(&path),
            Err(Error::CorruptSegment { .. })
        ));
    }

    #[test]
    fn test_missing_index_with_entries_rejected() {
        let dir = TempDir::new().unwrap();
        let path = build_segment(dir.path(), 5);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[12..16].copy_from_slice(&0u32.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            SstableReader::open(&path),
            Err(Error::CorruptSegment { .. })
        ));
    }

    #[test]
    fn test_empty_segment_lookups_miss() {
        let dir = TempDir::new().unwrap();
        let path = SstableWriter::create(dir.path()).unwrap().finish().unwrap();

        let reader = SstableReader::open(&path).unwrap();
        assert_eq!(reader.entry_count(), 0);
        assert_eq!(reader.get(b"anything").unwrap(), None);
        assert_eq!(reader.iter().unwrap().count(), 0);
    }
}
