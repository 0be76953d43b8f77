//! CinderDB is an embedded, single-node key/value store built as a small
//! log-structured merge engine.
//!
//! # Write path
//! 1. **WAL append**: every put is durable in `wal.log` before it is
//!    acknowledged
//! 2. **Memtable insert**: the put lands in an in-memory sorted buffer
//! 3. **Rotation**: a full memtable is frozen and handed to a background
//!    flush, which writes it as an immutable sorted segment and then
//!    truncates the WAL
//!
//! # Read path
//! 1. Active memtable
//! 2. The frozen memtable of an in-flight flush, if any
//! 3. Segments, newest to oldest
//!
//! Keys and values are arbitrary byte strings; ordering is lexicographic on
//! raw bytes.

pub mod config;
pub mod engine;
pub mod error;
pub mod memtable;
pub mod sstable;
pub mod wal;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
