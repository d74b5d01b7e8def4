//! Committed entry index and the open-handle table
//!
//! Both partition implementations keep their committed contents in an
//! `Index` and their sessions in a `HandleTable`. Staged mutations live in the
//! handle until commit hands them to the backing medium.

use hashbrown::HashMap;

use crate::error::{PartitionError, PartitionResult};
use crate::format::Record;
use crate::partition::{HandleId, OpenMode};

/// Bytes one entry occupies on flash (one 32-byte NVS entry slot)
pub const ENTRY_SIZE: u64 = 32;

/// Committed namespaces and their entries
#[derive(Debug, Clone, Default)]
pub struct Index {
    namespaces: HashMap<String, HashMap<String, u32>>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one committed record. `Commit` markers are ignored.
    pub fn apply(&mut self, record: &Record) {
        match record {
            Record::Set { namespace, key, value } => {
                self.namespaces
                    .entry_ref(namespace.as_str())
                    .or_default()
                    .insert(key.clone(), *value);
            }
            Record::EraseKey { namespace, key } => {
                if let Some(entries) = self.namespaces.get_mut(namespace.as_str()) {
                    entries.remove(key.as_str());
                }
            }
            Record::EraseNamespace { namespace } => {
                self.namespaces.entry_ref(namespace.as_str()).or_default().clear();
            }
            Record::Commit { .. } => {}
        }
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<u32> {
        self.namespaces.get(namespace).and_then(|entries| entries.get(key).copied())
    }

    pub fn contains_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    pub fn namespace_count(&self) -> usize {
        self.namespaces.len()
    }

    /// Number of entries across all namespaces
    pub fn entry_count(&self) -> usize {
        self.namespaces.values().map(|entries| entries.len()).sum()
    }

    /// Flash footprint of the live contents: one slot per namespace and per entry
    pub fn footprint(&self) -> u64 {
        (self.namespace_count() + self.entry_count()) as u64 * ENTRY_SIZE
    }

    pub fn clear(&mut self) {
        self.namespaces.clear();
    }

    /// Records that rebuild this index from nothing, in a stable order.
    ///
    /// Each namespace is introduced by an `EraseNamespace` so that empty
    /// namespaces survive.
    pub fn live_records(&self) -> Vec<Record> {
        let mut names: Vec<&String> = self.namespaces.keys().collect();
        names.sort();

        let mut records = Vec::new();
        for namespace in names {
            records.push(Record::EraseNamespace { namespace: namespace.clone() });
            let entries = &self.namespaces[namespace.as_str()];
            let mut keys: Vec<(&String, &u32)> = entries.iter().collect();
            keys.sort();
            for (key, value) in keys {
                records.push(Record::Set {
                    namespace: namespace.clone(),
                    key: key.clone(),
                    value: *value,
                });
            }
        }
        records
    }
}

/// One open session
#[derive(Debug)]
pub struct OpenHandle {
    pub namespace: String,
    pub mode: OpenMode,
    /// Mutations staged since open (or since the last commit)
    pub pending: Vec<Record>,
}

/// Open sessions keyed by handle id
#[derive(Debug, Default)]
pub struct HandleTable {
    handles: HashMap<HandleId, OpenHandle>,
    next_id: u32,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, namespace: &str, mode: OpenMode) -> HandleId {
        self.next_id = self.next_id.wrapping_add(1);
        let id = HandleId(self.next_id);
        self.handles.insert(
            id,
            OpenHandle { namespace: namespace.to_string(), mode, pending: Vec::new() },
        );
        id
    }

    pub fn get(&self, id: HandleId) -> PartitionResult<&OpenHandle> {
        self.handles.get(&id).ok_or(PartitionError::InvalidHandle { handle: id })
    }

    fn writable(&mut self, id: HandleId) -> PartitionResult<&mut OpenHandle> {
        let handle = self.handles.get_mut(&id).ok_or(PartitionError::InvalidHandle { handle: id })?;
        if handle.mode != OpenMode::ReadWrite {
            return Err(PartitionError::ReadOnly { handle: id });
        }
        Ok(handle)
    }

    /// Value of `key` as `id` sees it: committed state overlaid with its staging.
    pub fn lookup(&self, index: &Index, id: HandleId, key: &str) -> PartitionResult<Option<u32>> {
        let handle = self.get(id)?;
        let mut value = index.get(&handle.namespace, key);
        for record in &handle.pending {
            match record {
                Record::Set { key: k, value: v, .. } if k == key => value = Some(*v),
                Record::EraseKey { key: k, .. } if k == key => value = None,
                Record::EraseNamespace { .. } => value = None,
                _ => {}
            }
        }
        Ok(value)
    }

    /// Like `lookup`, with absence reported as `NotFound`.
    pub fn get_u32(&self, index: &Index, id: HandleId, key: &str) -> PartitionResult<u32> {
        match self.lookup(index, id, key)? {
            Some(value) => Ok(value),
            None => Err(PartitionError::NotFound {
                namespace: self.get(id)?.namespace.clone(),
                key: key.to_string(),
            }),
        }
    }

    pub fn stage_set(&mut self, id: HandleId, key: &str, value: u32) -> PartitionResult<()> {
        let handle = self.writable(id)?;
        let namespace = handle.namespace.clone();
        handle.pending.push(Record::Set { namespace, key: key.to_string(), value });
        Ok(())
    }

    pub fn stage_erase_key(
        &mut self,
        index: &Index,
        id: HandleId,
        key: &str,
    ) -> PartitionResult<()> {
        self.writable(id)?;
        self.get_u32(index, id, key)?;
        let handle = self.writable(id)?;
        let namespace = handle.namespace.clone();
        handle.pending.push(Record::EraseKey { namespace, key: key.to_string() });
        Ok(())
    }

    pub fn stage_erase_all(&mut self, id: HandleId) -> PartitionResult<()> {
        let handle = self.writable(id)?;
        let namespace = handle.namespace.clone();
        handle.pending.push(Record::EraseNamespace { namespace });
        Ok(())
    }

    /// Staged batch of `id`. Empty for read-only handles.
    pub fn pending(&self, id: HandleId) -> PartitionResult<&[Record]> {
        Ok(&self.get(id)?.pending)
    }

    pub fn clear_pending(&mut self, id: HandleId) {
        if let Some(handle) = self.handles.get_mut(&id) {
            handle.pending.clear();
        }
    }

    pub fn close(&mut self, id: HandleId) -> Option<OpenHandle> {
        self.handles.remove(&id)
    }

    /// Number of currently open handles
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }
}
