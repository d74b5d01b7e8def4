//! Transient partition session.
//!
//! A `StoreHandle` exclusively borrows the partition for its lifetime, so two
//! handles can never be open at once, and closes the underlying handle when
//! dropped, so no exit path leaks one.

use log::trace;
use nvmstore_core::{HandleId, OpenMode, Partition, PartitionResult};

/// Open handle on one namespace, released on drop.
pub struct StoreHandle<'p, P: Partition> {
    partition: &'p mut P,
    id: HandleId,
    mode: OpenMode,
}

impl<'p, P: Partition> StoreHandle<'p, P> {
    pub(crate) fn acquire(
        partition: &'p mut P,
        namespace: &str,
        mode: OpenMode,
    ) -> PartitionResult<Self> {
        let id = partition.open(namespace, mode)?;
        trace!("Acquired {} handle {} on '{}'", mode, id, namespace);
        Ok(Self { partition, id, mode })
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn get_u32(&mut self, key: &str) -> PartitionResult<u32> {
        self.partition.get_u32(self.id, key)
    }

    pub fn set_u32(&mut self, key: &str, value: u32) -> PartitionResult<()> {
        self.partition.set_u32(self.id, key, value)
    }

    pub fn erase_key(&mut self, key: &str) -> PartitionResult<()> {
        self.partition.erase_key(self.id, key)
    }

    pub fn erase_all(&mut self) -> PartitionResult<()> {
        self.partition.erase_all(self.id)
    }

    pub fn commit(&mut self) -> PartitionResult<()> {
        self.partition.commit(self.id)
    }
}

impl<P: Partition> Drop for StoreHandle<'_, P> {
    fn drop(&mut self) {
        self.partition.close(self.id);
        trace!("Released {} handle {}", self.mode, self.id);
    }
}
