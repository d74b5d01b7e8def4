//! Errors surfaced by the key-value store

use std::fmt;

use nvmstore_core::{OpenMode, PartitionError};
use thiserror::Error;

/// Step of `initialize` that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    /// The first `init`, with an error a full erase cannot cure
    FirstInit,
    /// The destructive erase after a stale-partition report
    Erase,
    /// The single `init` retry after the erase
    RetryInit,
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitStage::FirstInit => f.write_str("initial init"),
            InitStage::Erase => f.write_str("recovery erase"),
            InitStage::RetryInit => f.write_str("init retry"),
        }
    }
}

/// Key-value store error
#[derive(Debug, Clone, Error)]
pub enum KvsError {
    /// Partition could not be brought into a usable state. Fatal.
    #[error("Partition unusable ({stage}): {source}")]
    PartitionUnusable {
        stage: InitStage,
        #[source]
        source: PartitionError,
    },

    /// No session could be opened; nothing was changed
    #[error("Failed to open {mode} handle: {source}")]
    HandleAcquisitionFailed {
        mode: OpenMode,
        #[source]
        source: PartitionError,
    },

    /// Erase of a key that is not stored
    #[error("Key '{key}' not found")]
    KeyNotFound { key: String },

    /// Staging the value failed; nothing was committed and the prior value stands
    #[error("Failed to write key '{key}': {source}")]
    WriteFailed {
        key: String,
        #[source]
        source: PartitionError,
    },

    /// Lookup failed for a reason other than absence
    #[error("Failed to read key '{key}': {source}")]
    ReadFailed {
        key: String,
        #[source]
        source: PartitionError,
    },

    /// Staging an erase failed; nothing was committed. `key` is `None` for erase-all.
    #[error("Failed to erase {}: {source}", erase_target(.key))]
    EraseFailed {
        key: Option<String>,
        #[source]
        source: PartitionError,
    },

    /// Commit failed after the mutation was staged. Whether the mutation
    /// survives power loss is unspecified.
    #[error("Failed to commit changes (durability unspecified): {source}")]
    CommitFailed {
        #[source]
        source: PartitionError,
    },

    /// Key rejected before any partition access
    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },
}

impl KvsError {
    /// True when the attempted mutation may or may not have reached flash.
    pub fn durability_unspecified(&self) -> bool {
        matches!(self, KvsError::CommitFailed { .. })
    }

    /// The substrate error behind this one, if any.
    pub fn partition_error(&self) -> Option<&PartitionError> {
        match self {
            KvsError::PartitionUnusable { source, .. }
            | KvsError::HandleAcquisitionFailed { source, .. }
            | KvsError::WriteFailed { source, .. }
            | KvsError::ReadFailed { source, .. }
            | KvsError::EraseFailed { source, .. }
            | KvsError::CommitFailed { source } => Some(source),
            KvsError::KeyNotFound { .. } | KvsError::InvalidKey { .. } => None,
        }
    }
}

/// Result type alias for store operations
pub type KvsResult<T> = Result<T, KvsError>;

fn erase_target(key: &Option<String>) -> String {
    match key {
        Some(k) => format!("key '{}'", k),
        None => "all keys".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_failed_flags_durability() {
        let err = KvsError::CommitFailed { source: PartitionError::Injected("flash busy".into()) };
        assert!(err.durability_unspecified());
        assert!(err.to_string().contains("durability unspecified"));

        let err = KvsError::KeyNotFound { key: "k".into() };
        assert!(!err.durability_unspecified());
        assert!(err.partition_error().is_none());
    }

    #[test]
    fn test_erase_failed_display() {
        let one = KvsError::EraseFailed {
            key: Some("temp".into()),
            source: PartitionError::NotInitialized,
        };
        assert!(one.to_string().contains("key 'temp'"));

        let all = KvsError::EraseFailed { key: None, source: PartitionError::NotInitialized };
        assert!(all.to_string().contains("all keys"));
    }

    #[test]
    fn test_source_chain() {
        use std::error::Error;
        let err = KvsError::PartitionUnusable {
            stage: InitStage::RetryInit,
            source: PartitionError::NoFreePages { used_bytes: 1, usable_bytes: 0 },
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains("init retry"));
    }
}
