//! Shared persistence facts for the minimization toolchain.
//!
//! The influence relation between syscalls is expensive to recompute and is
//! shared by every minimization session, so it is persisted once per target
//! revision as an `rkyv` archive and reopened read-only through an mmap.

pub mod traits;

use memmap2::Mmap;
use rkyv::{Archive, Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Errors from snapshot persistence.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Encode error: {0}")]
    EncodeError(String),
    #[error("Decode error: {0}")]
    DecodeError(String),
}

/// Dense influence bits for one target revision, one `u64` word per 64 bits
/// of the row-major `syscall_count x syscall_count` matrix.
#[derive(Debug, Clone, PartialEq, Archive, Deserialize, Serialize)]
#[rkyv(derive(Debug))]
pub struct InfluenceSnapshot {
    /// Number of distinct syscall ids; the matrix is `n x n`.
    pub syscall_count: u32,
    /// Revision string of the syscall descriptions the bits were computed
    /// against. A mismatch at load time means the snapshot is stale.
    pub revision: String,
    pub words: Vec<u64>,
}

impl InfluenceSnapshot {
    /// Serializes the snapshot to bytes using `rkyv`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        let aligned = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| SnapshotError::EncodeError(e.to_string()))?;
        Ok(aligned.to_vec())
    }

    /// Saves the snapshot to a file, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = self.to_bytes()?;
        let mut file = File::create(path)?;
        file.write_all(&bytes)?;
        Ok(())
    }
}

/// Memory-mapped read-only snapshot handle.
pub struct MappedSnapshot {
    _mmap: Mmap,
}

impl MappedSnapshot {
    /// Opens a snapshot file via mmap and validates the archive.
    pub fn open(path: &Path) -> Result<Self, SnapshotError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        rkyv::access::<ArchivedInfluenceSnapshot, rkyv::rancor::Error>(&mmap)
            .map_err(|e| SnapshotError::DecodeError(e.to_string()))?;

        Ok(Self { _mmap: mmap })
    }

    /// Returns a reference to the archived snapshot (zero-copy).
    pub fn archived(&self) -> &ArchivedInfluenceSnapshot {
        // SAFETY: the archive was validated in `open()` via rkyv::access and
        // the mmap lives as long as self.
        unsafe { rkyv::access_unchecked::<ArchivedInfluenceSnapshot>(&self._mmap[..]) }
    }

    /// Deserializes the archive into an owned snapshot.
    pub fn to_owned(&self) -> Result<InfluenceSnapshot, SnapshotError> {
        rkyv::deserialize::<_, rkyv::rancor::Error>(self.archived())
            .map_err(|e| SnapshotError::DecodeError(e.to_string()))
    }
}
