//! This module defines [`DbError`], [`FindError`] and [`NodeError`].

use triedb_async::IoError;

/// Errors from parsing a node record.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The record bytes contradict the declared layout.
    #[error("corrupt node record: {detail}")]
    Corrupt {
        /// What failed to add up.
        detail: String,
    },
}

/// Outcome kinds of a trie lookup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FindError {
    /// The traversal terminated successfully with no match.
    #[error("key not found")]
    KeyNotFound,

    /// A node's stored path contradicted the query; a data integrity
    /// signal, not a miss.
    #[error("key mismatch while walking stored path")]
    KeyMismatch,

    /// The requested version lies outside the history window.
    #[error("version no longer exists")]
    VersionNoLongerExists,

    /// An underlying read failed.
    #[error("read failed: {0}")]
    Io(String),
}

/// Errors surfaced by the database facade.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A lookup ended without a value; carries the find outcome.
    #[error(transparent)]
    Find(#[from] FindError),

    /// The underlying engine failed.
    #[error(transparent)]
    Io(#[from] IoError),

    /// A node record failed to parse.
    #[error(transparent)]
    Node(#[from] NodeError),

    /// No free chunk is available and compaction cannot reclaim space.
    #[error("storage exhausted")]
    StorageExhausted,

    /// Magic mismatch or structural check failure on open. Fatal.
    #[error("metadata corrupt: {detail}")]
    MetadataCorrupt {
        /// What failed.
        detail: String,
    },

    /// Upserts must be strictly monotone in version.
    #[error("non-monotonic upsert: version {requested} does not advance {current}")]
    NonMonotonicVersion {
        /// Latest version in history.
        current: i64,
        /// The rejected version.
        requested: i64,
    },
}
