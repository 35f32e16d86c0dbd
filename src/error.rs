//! Crate-wide error kinds.
//!
//! Each variant maps to one failure domain: configuration, validation of
//! on-disk layout, embedding providers, the SQLite store, filesystem I/O,
//! sync copies, and the file watcher. Operations return [`Result`] and
//! propagate with `?`; nothing here is used for control flow.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or inconsistent configuration (uninitialized root, no central
    /// repo, no sync mapping). Never retried.
    #[error("config error: {0}")]
    Config(String),

    /// On-disk layout or document violates an invariant (case-conflicting
    /// memory files, registry collision, malformed JSON manifest).
    #[error("validation error: {0}")]
    Validation(String),

    /// Embedding provider failure after retries were exhausted.
    #[error("provider error: {0}")]
    Provider(String),

    /// Database open or transaction failure. Writes are transactional, so a
    /// retry against the on-disk store is safe.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("io error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A per-file sync copy failed. Collected into the operation's error
    /// list; other files continue.
    #[error("sync error for {path}: {reason}")]
    Sync { path: String, reason: String },

    #[error("watcher error: {0}")]
    Watcher(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocking task was cancelled or panicked.
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Filesystem { path: path.into(), source }
    }
}
