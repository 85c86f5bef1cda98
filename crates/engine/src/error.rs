use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::world::position::{ChunkPos, RegionPos};

/// Errors surfaced by chunk storage.
///
/// I/O and corruption are kept apart so callers can decide whether a chunk
/// should be retried later or quarantined.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Opening, reading, writing or closing a region file failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The stored bytes for a chunk could not be decoded.
    #[error("corrupt chunk {pos:?}: {reason}")]
    Corrupt { pos: ChunkPos, reason: String },
    /// A schema migration step failed for one chunk.
    #[error("migrating chunk {pos:?} failed: {source}")]
    Migration {
        pos: ChunkPos,
        #[source]
        source: MigrationError,
    },
    /// One or more region files failed to close. The operation that
    /// triggered the close has already taken effect.
    #[error("{0}")]
    CloseFailed(CloseFailures),
    /// The storage worker is no longer running.
    #[error("storage worker has shut down")]
    WorkerClosed,
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(pos: ChunkPos, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            pos,
            reason: reason.into(),
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Close failures gathered across several region files.
#[derive(Debug, Default)]
pub struct CloseFailures {
    pub failures: Vec<(RegionPos, io::Error)>,
}

impl CloseFailures {
    pub fn push(&mut self, region: RegionPos, error: io::Error) {
        self.failures.push((region, error));
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// `Ok(())` when nothing failed, otherwise the aggregate as an error.
    pub fn into_result(self) -> Result<(), StorageError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(StorageError::CloseFailed(self))
        }
    }
}

impl fmt::Display for CloseFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to close {} region file(s)", self.failures.len())?;
        for (region, err) in &self.failures {
            write!(f, "; r.{}.{}: {}", region.x, region.z, err)?;
        }
        Ok(())
    }
}

/// A schema transform or legacy splice failed on a document.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("fix '{fix}' (version {version}) failed: {reason}")]
    Step {
        fix: &'static str,
        version: i32,
        reason: String,
    },
    #[error("legacy structure data: {0}")]
    Legacy(String),
    #[error("malformed document: {0}")]
    Malformed(String),
}

/// Registering a compression codec failed.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("codec id {0} is already registered")]
    IdTaken(u8),
    #[error("codec id {0} is reserved for the external-record flag")]
    Reserved(u8),
}
