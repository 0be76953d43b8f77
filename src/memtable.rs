//! In-memory sorted write buffer.
//!
//! The memtable is a concurrent skip list mapping keys to values, with an
//! approximate byte counter that drives rotation. Mutation happens only on
//! the engine's writer path; readers probe concurrently through shared
//! `Arc` handles and see either the previous or the freshly installed
//! memtable, never a torn state.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;

/// Accounts for the two length prefixes a record costs on disk.
const RECORD_OVERHEAD: usize = 8;

/// In-memory sorted table using a concurrent skip list.
#[derive(Debug)]
pub struct Memtable {
    data: SkipMap<Vec<u8>, Vec<u8>>,
    size: AtomicUsize,
}

impl Memtable {
    /// Creates a new empty memtable.
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
            size: AtomicUsize::new(0),
        }
    }

    /// Inserts or overwrites a key-value pair and adjusts the approximate
    /// byte counter by the record's size delta.
    pub fn insert(&self, key: Vec<u8>, value: Vec<u8>) {
        let new_size = key.len() + value.len() + RECORD_OVERHEAD;
        let old_size = self
            .data
            .get(key.as_slice())
            .map(|entry| entry.key().len() + entry.value().len() + RECORD_OVERHEAD);

        self.data.insert(key, value);

        match old_size {
            None => {
                self.size.fetch_add(new_size, Ordering::SeqCst);
            }
            Some(old) if new_size >= old => {
                self.size.fetch_add(new_size - old, Ordering::SeqCst);
            }
            Some(old) => {
                self.size.fetch_sub(old - new_size, Ordering::SeqCst);
            }
        }
    }

    /// Retrieves the value for a key.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// Approximate bytes held, counting keys, values and record overhead.
    pub fn approximate_size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// True once the approximate size has reached the given budget.
    pub fn is_full(&self, max_bytes: usize) -> bool {
        self.approximate_size() >= max_bytes
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterates over all records in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (Vec<u8>, Vec<u8>)> + '_ {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }
}
