//! This module defines [`IoError`].

/// Errors surfaced by the I/O engine and the storage pool.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// The underlying ring returned a POSIX error other than `EAGAIN`.
    #[error("i/o failure: {0}")]
    Failure(#[from] std::io::Error),

    /// No free chunk is available and compaction cannot reclaim space.
    #[error("storage exhausted: no free chunk available")]
    StorageExhausted,

    /// A read returned fewer bytes than the operation required.
    #[error("short read: wanted {wanted} bytes, got {got}")]
    ShortRead {
        /// Bytes requested.
        wanted: usize,
        /// Bytes the completion delivered.
        got: usize,
    },

    /// A write persisted fewer bytes than submitted.
    #[error("short write: wanted {wanted} bytes, got {got}")]
    ShortWrite {
        /// Bytes submitted.
        wanted: usize,
        /// Bytes the completion delivered.
        got: usize,
    },

    /// The storage pool refused the configuration.
    #[error("storage pool: {0}")]
    Pool(String),
}

impl IoError {
    /// Build from a raw negated errno as carried by ring completions.
    #[must_use]
    pub fn from_raw_os(errno: i32) -> Self {
        Self::Failure(std::io::Error::from_raw_os_error(errno))
    }
}
