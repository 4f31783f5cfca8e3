use std::io;
use std::path::PathBuf;

/// Errors raised while opening, synchronizing or refactoring documents.
#[derive(Debug, thiserror::Error)]
pub enum DocCacheError {
    /// The file service could not read the file.
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The requested path escapes the served root directory.
    #[error("path is outside the served root: {0}")]
    OutsideRoot(String),

    /// The operation needs a file that was never opened through the service.
    #[error("file is not open: {0}")]
    NotOpen(String),

    /// The classification cache has no entry for the file.
    #[error("unknown file in classification cache: {0}")]
    UnknownFile(String),

    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("invalid refactoring file: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DocCacheError>;
