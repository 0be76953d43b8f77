use std::path::PathBuf;

use thiserror::Error;

/// A CinderDB result.
pub type Result<T> = std::result::Result<T, Error>;

/// CinderDB errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A failure of the underlying storage: open, read, write, sync, rename
    /// or delete.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A segment file violates the on-disk format. Surfaced when opening
    /// that segment; the engine logs and skips such files at startup.
    #[error("corrupt segment {}: {reason}", .path.display())]
    CorruptSegment { path: PathBuf, reason: String },

    /// Configuration rejected at open.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptSegment {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
