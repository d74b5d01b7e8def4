//! The substrate contract
//!
//! A `Partition` is a non-volatile region holding u32 entries grouped in
//! namespaces. Callers open a handle, stage mutations through it, commit them
//! as one batch, and close it. Nothing staged is visible to other handles, or
//! durable, until `commit` returns Ok.

use std::fmt;

use crate::error::{PartitionError, PartitionResult};

/// Access mode of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenMode::ReadOnly => f.write_str("read-only"),
            OpenMode::ReadWrite => f.write_str("read-write"),
        }
    }
}

/// Opaque identifier of an open handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub(crate) u32);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle-scoped access to a non-volatile key-value region.
///
/// Lifecycle: `init` once (or `erase_partition` then `init` to recover a stale
/// partition), then any number of `open` / act / `commit` / `close` sessions.
pub trait Partition {
    /// Bring the partition into a usable state.
    ///
    /// Fails with `NewVersionFound` or `NoFreePages` when the stored layout is
    /// stale; both are cured by `erase_partition`.
    fn init(&mut self) -> PartitionResult<()>;

    /// Destroy every entry and return to the uninitialized state.
    fn erase_partition(&mut self) -> PartitionResult<()>;

    /// Open a handle on `namespace`.
    ///
    /// A read-only open of a namespace nothing was ever committed to fails
    /// with `NotFound`.
    fn open(&mut self, namespace: &str, mode: OpenMode) -> PartitionResult<HandleId>;

    /// Value of `key` as seen by `handle` (committed state plus its own staged
    /// mutations). `NotFound` when absent.
    fn get_u32(&mut self, handle: HandleId, key: &str) -> PartitionResult<u32>;

    /// Stage an insert or overwrite.
    fn set_u32(&mut self, handle: HandleId, key: &str, value: u32) -> PartitionResult<()>;

    /// Stage removal of `key`. `NotFound` when absent.
    fn erase_key(&mut self, handle: HandleId, key: &str) -> PartitionResult<()>;

    /// Stage removal of every entry in the handle's namespace.
    fn erase_all(&mut self, handle: HandleId) -> PartitionResult<()>;

    /// Durably apply everything staged on `handle` as one batch.
    fn commit(&mut self, handle: HandleId) -> PartitionResult<()>;

    /// Release `handle`, discarding anything not committed.
    fn close(&mut self, handle: HandleId);

    /// Longest namespace or key name, in bytes, this partition accepts.
    fn max_name_len(&self) -> usize;
}

/// Check a namespace or key name against the substrate naming rules.
pub fn validate_name(name: &str, max_len: usize) -> PartitionResult<()> {
    let reason = if name.is_empty() {
        "name is empty".to_string()
    } else if name.len() > max_len {
        format!("{} bytes exceeds limit of {}", name.len(), max_len)
    } else if name.contains('\0') {
        "name contains a NUL byte".to_string()
    } else {
        return Ok(());
    };
    Err(PartitionError::InvalidName { name: name.to_string(), reason })
}
