//! RAM-backed partition with fault injection
//!
//! The flash contents live in a `SharedFlash` that outlives any one
//! `MemPartition`, so dropping a partition and building a new one over the same
//! flash behaves like a power cycle: committed entries survive, open handles
//! and staged mutations do not.
//!
//! Faults are planted per call site and consumed in FIFO order.

use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashMap;
use log::{debug, trace};
use parking_lot::Mutex;

use crate::config::PartitionConfig;
use crate::error::{PartitionError, PartitionResult};
use crate::format::FORMAT_VERSION;
use crate::index::{HandleTable, Index};
use crate::partition::{validate_name, HandleId, OpenMode, Partition};

#[derive(Debug, Default)]
struct FlashState {
    /// `None` while blank (never formatted, or erased)
    version: Option<u32>,
    index: Index,
}

/// Flash contents shared across simulated reboots
#[derive(Debug, Clone, Default)]
pub struct SharedFlash {
    inner: Arc<Mutex<FlashState>>,
}

impl SharedFlash {
    /// Blank, never-formatted flash
    pub fn new() -> Self {
        Self::default()
    }

    /// Flash formatted by a build with a different layout version
    pub fn with_version(version: u32) -> Self {
        let flash = Self::new();
        flash.inner.lock().version = Some(version);
        flash
    }

    pub fn is_formatted(&self) -> bool {
        self.inner.lock().version.is_some()
    }

    pub fn version(&self) -> Option<u32> {
        self.inner.lock().version
    }

    /// Committed value, bypassing any handle
    pub fn peek(&self, namespace: &str, key: &str) -> Option<u32> {
        self.inner.lock().index.get(namespace, key)
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().index.entry_count()
    }

    /// Bytes the committed contents occupy
    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().index.footprint()
    }
}

/// Call sites a fault can be planted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Init,
    ErasePartition,
    Open,
    Get,
    Set,
    EraseKey,
    EraseAll,
    Commit,
}

/// Queued failures per call site
#[derive(Debug, Default)]
pub struct FaultPlan {
    queued: HashMap<FaultPoint, VecDeque<PartitionError>>,
}

impl FaultPlan {
    /// Make the next call at `point` fail with `err`.
    pub fn inject(&mut self, point: FaultPoint, err: PartitionError) {
        self.queued.entry(point).or_default().push_back(err);
    }

    fn take(&mut self, point: FaultPoint) -> Option<PartitionError> {
        self.queued.get_mut(&point).and_then(|queue| queue.pop_front())
    }

    /// Faults still waiting to fire
    pub fn remaining(&self) -> usize {
        self.queued.values().map(|queue| queue.len()).sum()
    }
}

/// Call counters for asserting on the substrate traffic a caller generates
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemStats {
    pub init_calls: u32,
    pub erase_partition_calls: u32,
    pub opens: u32,
    pub closes: u32,
    pub commits: u32,
    /// Highest number of simultaneously open handles
    pub max_open_handles: usize,
}

/// Partition held in RAM
#[derive(Debug)]
pub struct MemPartition {
    flash: SharedFlash,
    config: PartitionConfig,
    handles: HandleTable,
    initialized: bool,
    faults: FaultPlan,
    stats: MemStats,
}

impl MemPartition {
    /// Fresh blank flash with the given geometry
    pub fn new(config: PartitionConfig) -> Self {
        Self::with_flash(SharedFlash::new(), config)
    }

    /// Attach to existing flash, as after a reboot
    pub fn with_flash(flash: SharedFlash, config: PartitionConfig) -> Self {
        Self {
            flash,
            config,
            handles: HandleTable::new(),
            initialized: false,
            faults: FaultPlan::default(),
            stats: MemStats::default(),
        }
    }

    /// The flash this partition sits on
    pub fn flash(&self) -> SharedFlash {
        self.flash.clone()
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    pub fn faults(&mut self) -> &mut FaultPlan {
        &mut self.faults
    }

    pub fn stats(&self) -> &MemStats {
        &self.stats
    }

    /// Number of handles currently open
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn check_fault(&mut self, point: FaultPoint) -> PartitionResult<()> {
        match self.faults.take(point) {
            Some(err) => {
                debug!("Injected fault at {:?}: {}", point, err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn ensure_initialized(&self) -> PartitionResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(PartitionError::NotInitialized)
        }
    }
}

impl Partition for MemPartition {
    fn init(&mut self) -> PartitionResult<()> {
        self.stats.init_calls += 1;
        self.check_fault(FaultPoint::Init)?;
        self.config.validate().map_err(|reason| PartitionError::Corrupted {
            path: "<mem>".into(),
            offset: 0,
            reason,
        })?;

        let mut state = self.flash.inner.lock();
        match state.version {
            None => {
                debug!("Formatting blank RAM partition");
                state.version = Some(FORMAT_VERSION);
                state.index.clear();
            }
            Some(found) if found != FORMAT_VERSION => {
                return Err(PartitionError::NewVersionFound { found, expected: FORMAT_VERSION });
            }
            Some(_) => {}
        }

        let used_bytes = state.index.footprint();
        let usable_bytes = self.config.usable_bytes();
        if used_bytes > usable_bytes {
            return Err(PartitionError::NoFreePages { used_bytes, usable_bytes });
        }
        drop(state);

        self.handles.clear();
        self.initialized = true;
        Ok(())
    }

    fn erase_partition(&mut self) -> PartitionResult<()> {
        self.stats.erase_partition_calls += 1;
        self.check_fault(FaultPoint::ErasePartition)?;

        let mut state = self.flash.inner.lock();
        state.version = None;
        state.index.clear();
        drop(state);

        self.handles.clear();
        self.initialized = false;
        Ok(())
    }

    fn open(&mut self, namespace: &str, mode: OpenMode) -> PartitionResult<HandleId> {
        self.ensure_initialized()?;
        self.check_fault(FaultPoint::Open)?;
        validate_name(namespace, self.config.max_name_len)?;

        let known = self.flash.inner.lock().index.contains_namespace(namespace);
        if mode == OpenMode::ReadOnly && !known {
            return Err(PartitionError::NotFound {
                namespace: namespace.to_string(),
                key: String::new(),
            });
        }

        let id = self.handles.open(namespace, mode);
        self.stats.opens += 1;
        self.stats.max_open_handles = self.stats.max_open_handles.max(self.handles.len());
        trace!("Opened {} handle {} on '{}'", mode, id, namespace);
        Ok(id)
    }

    fn get_u32(&mut self, handle: HandleId, key: &str) -> PartitionResult<u32> {
        self.ensure_initialized()?;
        self.check_fault(FaultPoint::Get)?;
        validate_name(key, self.config.max_name_len)?;
        let state = self.flash.inner.lock();
        self.handles.get_u32(&state.index, handle, key)
    }

    fn set_u32(&mut self, handle: HandleId, key: &str, value: u32) -> PartitionResult<()> {
        self.ensure_initialized()?;
        self.check_fault(FaultPoint::Set)?;
        validate_name(key, self.config.max_name_len)?;
        self.handles.stage_set(handle, key, value)
    }

    fn erase_key(&mut self, handle: HandleId, key: &str) -> PartitionResult<()> {
        self.ensure_initialized()?;
        self.check_fault(FaultPoint::EraseKey)?;
        validate_name(key, self.config.max_name_len)?;
        let state = self.flash.inner.lock();
        self.handles.stage_erase_key(&state.index, handle, key)
    }

    fn erase_all(&mut self, handle: HandleId) -> PartitionResult<()> {
        self.ensure_initialized()?;
        self.check_fault(FaultPoint::EraseAll)?;
        self.handles.stage_erase_all(handle)
    }

    fn commit(&mut self, handle: HandleId) -> PartitionResult<()> {
        self.ensure_initialized()?;
        self.check_fault(FaultPoint::Commit)?;

        let batch = self.handles.pending(handle)?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut state = self.flash.inner.lock();
        let mut projected = state.index.clone();
        for record in batch {
            projected.apply(record);
        }
        let required = projected.footprint();
        let usable = self.config.usable_bytes();
        if required > usable {
            return Err(PartitionError::NotEnoughSpace {
                required,
                available: usable.saturating_sub(state.index.footprint()),
            });
        }
        state.index = projected;
        drop(state);

        self.stats.commits += 1;
        self.handles.clear_pending(handle);
        Ok(())
    }

    fn close(&mut self, handle: HandleId) {
        if self.handles.close(handle).is_some() {
            self.stats.closes += 1;
            trace!("Closed handle {}", handle);
        }
    }

    fn max_name_len(&self) -> usize {
        self.config.max_name_len
    }
}
