//! Error types for partition operations
//!
//! Every substrate failure is a `PartitionError`. The variants mirror the
//! failure classes a flash key-value substrate reports, with enough context
//! attached to log and act on them.

use std::path::PathBuf;

use thiserror::Error;

use crate::partition::HandleId;

/// Partition error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum PartitionError {
    /// Operation requires a successful `init` first
    #[error("Partition is not initialized")]
    NotInitialized,

    /// Stored contents do not fit the usable capacity (partition truncated or full)
    #[error("Partition has no free pages: {used_bytes} bytes used, {usable_bytes} usable")]
    NoFreePages {
        /// Bytes occupied by the stored contents
        used_bytes: u64,
        /// Bytes usable with the current geometry
        usable_bytes: u64,
    },

    /// Stored format version differs from the running software
    #[error("Partition format version {found} found, expected {expected}")]
    NewVersionFound {
        /// Version read from the partition header
        found: u32,
        /// Version this build writes
        expected: u32,
    },

    /// Requested key or namespace does not exist
    #[error("Not found: {namespace}/{key}")]
    NotFound {
        /// Namespace that was searched
        namespace: String,
        /// Key that was searched (empty when the namespace itself is missing)
        key: String,
    },

    /// Handle is not open (never opened or already closed)
    #[error("Invalid handle {handle}")]
    InvalidHandle {
        /// The offending handle
        handle: HandleId,
    },

    /// Mutation attempted through a read-only handle
    #[error("Handle {handle} is read-only")]
    ReadOnly {
        /// The read-only handle
        handle: HandleId,
    },

    /// Namespace or key name rejected
    #[error("Invalid name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// A commit batch does not fit in the remaining space
    #[error("Not enough space: batch needs {required} bytes, {available} available")]
    NotEnoughSpace {
        /// Bytes the batch needs
        required: u64,
        /// Bytes still free
        available: u64,
    },

    /// Partition image is damaged in a way replay cannot skip over
    #[error("Partition corrupted in {} at offset {offset}: {reason}", .path.display())]
    Corrupted {
        /// Partition image path
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Checksum verification failed
    #[error("Checksum mismatch at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}")]
    ChecksumMismatch {
        /// Checksum stored alongside the data
        expected: u32,
        /// Checksum computed over the data
        actual: u32,
        /// Byte offset of the checked data
        offset: u64,
    },

    /// Record truncated at the end of the image (crash mid-write)
    #[error("Torn write at offset {offset}: need {expected_size} bytes, have {available_bytes}")]
    TornWrite {
        /// Bytes the record claims
        expected_size: u32,
        /// Bytes actually present
        available_bytes: u64,
        /// Offset where the torn record starts
        offset: u64,
    },

    /// I/O operation on the backing medium failed
    #[error("I/O error{}: {message} ({kind})", io_location(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Fault planted by a test through `MemPartition::faults`
    #[error("Injected fault: {0}")]
    Injected(String),
}

impl PartitionError {
    /// True for the two stale-partition classes that a full erase repairs.
    pub fn is_recoverable_by_erase(&self) -> bool {
        matches!(
            self,
            PartitionError::NoFreePages { .. } | PartitionError::NewVersionFound { .. }
        )
    }

    /// True when the error reports a missing key or namespace.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PartitionError::NotFound { .. })
    }

    pub(crate) fn io(path: &std::path::Path, err: std::io::Error, what: &str) -> Self {
        PartitionError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }
}

/// Convert std::io::Error to PartitionError::Io
impl From<std::io::Error> for PartitionError {
    fn from(err: std::io::Error) -> Self {
        PartitionError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for partition operations
pub type PartitionResult<T> = Result<T, PartitionError>;

fn io_location(path: &Option<PathBuf>) -> String {
    path.as_ref().map(|p| format!(" in {}", p.display())).unwrap_or_default()
}
