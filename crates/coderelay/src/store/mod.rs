//! Generic blob persistence for process snapshots.
//!
//! Two named snapshots are used by the core: the session list and the
//! project map. The store is a plain key-value blob interface; callers own
//! serialization.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

pub mod file;
pub mod writer;

pub use file::FileBlobStore;
pub use writer::SnapshotWriter;

/// Snapshot name for the session list.
pub const SESSIONS_SNAPSHOT: &str = "sessions.json";
/// Snapshot name for the project map.
pub const PROJECTS_SNAPSHOT: &str = "projects.json";

/// Errors from blob persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Atomic read/write of named blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a blob, or `None` when it has never been written.
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace a blob atomically (write-temp-then-rename).
    async fn write(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError>;
}
