//! Immutable on-disk sorted segments (SSTables).
//!
//! # File layout
//!
//! ```text
//! +----------------------------+
//! | Header (24 bytes)          |
//! |   magic:             u32   |
//! |   version:           u32   |
//! |   entry_count:       u32   |
//! |   index_entry_count: u32   |
//! |   index_offset:      u64   |
//! +----------------------------+
//! | Data records, sorted:      |
//! |   key_len:i32 | key        |
//! |   val_len:i32 | value      |
//! +----------------------------+
//! | Sparse index:              |
//! |   key_len:i32 | key        |
//! |   offset: i64              |
//! +----------------------------+
//! ```
//!
//! Integers are little-endian. The sparse index names every
//! [`SPARSE_INDEX_STRIDE`]th data record starting with the first, so any
//! lookup is localized to a window of at most one stride of records.
//!
//! Files are named `sstable_<UTC timestamp>.sst` with millisecond precision,
//! making lexicographic filename order match creation order. Construction
//! goes through a `.tmp` path renamed into place, so a file carrying the
//! final suffix is always fully formed.

pub mod reader;
pub mod writer;

pub use reader::SstableReader;
pub use writer::SstableWriter;

use chrono::Utc;

/// "SSTB" in ASCII.
pub const MAGIC: u32 = 0x5353_5442;

/// Newest understood format version.
pub const VERSION: u32 = 1;

/// Fixed header size in bytes.
pub const HEADER_LEN: u64 = 24;

/// One sparse-index entry per this many data records.
pub const SPARSE_INDEX_STRIDE: usize = 16;

pub const FILE_PREFIX: &str = "sstable_";
pub const FILE_SUFFIX: &str = ".sst";
pub const TMP_SUFFIX: &str = ".tmp";

/// `YYYYMMDD_HHMMSS_fff`, UTC.
pub(crate) fn timestamp_now() -> String {
    Utc::now().format("%Y%m%d_%H%M%S_%3f").to_string()
}

/// True for file names following the `sstable_<timestamp>.sst` scheme.
/// Anything else in the data directory is ignored at startup.
pub fn is_segment_file_name(name: &str) -> bool {
    let Some(stem) = name
        .strip_prefix(FILE_PREFIX)
        .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
    else {
        return false;
    };
    stem.len() == 19 && stem.bytes().all(|b| b.is_ascii_digit() || b == b'_')
}
