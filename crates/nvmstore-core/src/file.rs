//! Partition persisted in a host file
//!
//! `FilePartition` keeps the committed entries in a RAM `Index` and the
//! durable copy in a single append-only image (`partition.nvs`).
//!
//! **Read path**: RAM index overlaid with the handle's staged mutations
//! **Commit path**: image append + durable_sync first, then index update
//! **Full image**: compact the live set into a fresh image, then retry

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, info, trace, warn};

use crate::config::PartitionConfig;
use crate::error::{PartitionError, PartitionResult};
use crate::format::{encode_batch, PARTITION_HEADER_SIZE};
use crate::index::{HandleTable, Index};
use crate::partition::{validate_name, HandleId, OpenMode, Partition};
use crate::platform_durability::sync_dir;
use crate::wal::{WalReader, WalWriter};

/// Name of the partition image inside the partition directory
pub const IMAGE_FILE: &str = "partition.nvs";

/// Suffix of the image being built during compaction
const COMPACT_SUFFIX: &str = "compact";

/// Result of a compaction pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    /// Image size before
    pub original_bytes: u64,
    /// Image size after
    pub compacted_bytes: u64,
    /// Live entries carried over
    pub live_entries: usize,
}

impl CompactionResult {
    pub fn bytes_saved(&self) -> u64 {
        self.original_bytes.saturating_sub(self.compacted_bytes)
    }
}

/// Partition backed by an image file in `dir`.
pub struct FilePartition {
    dir: PathBuf,
    config: PartitionConfig,
    index: Index,
    handles: HandleTable,
    /// `Some` once `init` succeeded
    wal: Option<WalWriter>,
}

impl FilePartition {
    /// Bind to a partition directory, creating it if needed.
    ///
    /// Nothing is read until `init`.
    pub fn open<P: AsRef<Path>>(dir: P, config: PartitionConfig) -> PartitionResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        config.validate().map_err(|reason| PartitionError::Corrupted {
            path: dir.clone(),
            offset: 0,
            reason: format!("invalid partition geometry: {}", reason),
        })?;
        fs::create_dir_all(&dir)
            .map_err(|e| PartitionError::io(&dir, e, "Failed to create partition directory"))?;

        Ok(Self {
            dir,
            config,
            index: Index::new(),
            handles: HandleTable::new(),
            wal: None,
        })
    }

    pub fn image_path(&self) -> PathBuf {
        self.dir.join(IMAGE_FILE)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// Committed entries across all namespaces
    pub fn entry_count(&self) -> usize {
        self.index.entry_count()
    }

    /// Current image size in bytes (0 before `init`)
    pub fn used_bytes(&self) -> u64 {
        self.wal.as_ref().map_or(0, |wal| wal.current_size())
    }

    /// Number of handles currently open
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn wal_mut(&mut self) -> PartitionResult<&mut WalWriter> {
        self.wal.as_mut().ok_or(PartitionError::NotInitialized)
    }

    fn ensure_initialized(&self) -> PartitionResult<()> {
        if self.wal.is_some() {
            Ok(())
        } else {
            Err(PartitionError::NotInitialized)
        }
    }

    /// Rewrite the image with only the live entries.
    ///
    /// Atomic rename pattern:
    /// 1. Write header + one committed batch of live records to `partition.nvs.compact`
    /// 2. durable_sync it
    /// 3. Rename over `partition.nvs`
    /// 4. sync the directory
    ///
    /// A crash before step 3 leaves the old image intact and an orphaned
    /// temp file that the next compaction overwrites.
    pub fn compact(&mut self) -> PartitionResult<CompactionResult> {
        let original_bytes = self.wal_mut()?.current_size();
        let image = self.image_path();
        let compact_path = image.with_extension(format!("nvs.{}", COMPACT_SUFFIX));
        let live = self.index.live_records();

        {
            let mut writer = WalWriter::create(&compact_path)?;
            if !live.is_empty() {
                writer.append_batch(&live)?;
            }
        }

        // The old writer must not hold the image open across the rename
        let previous = self.wal.take();
        if let Err(e) = fs::rename(&compact_path, &image) {
            self.wal = previous;
            return Err(PartitionError::io(&image, e, "Failed to rename compacted image"));
        }
        drop(previous);

        let compacted_bytes = fs::metadata(&image)
            .map_err(|e| PartitionError::io(&image, e, "Failed to stat compacted image"))
            .and_then(|meta| {
                let writer = WalWriter::resume(&image, meta.len())?;
                self.wal = Some(writer);
                Ok(meta.len())
            })
            .map_err(|e| {
                error!(
                    "Compacted image {} in place but cannot reopen it, partition needs init: {}",
                    image.display(),
                    e
                );
                e
            })?;
        sync_dir(&self.dir).map_err(|e| {
            PartitionError::io(&self.dir, e, "Failed to sync directory after compaction")
        })?;

        let result = CompactionResult {
            original_bytes,
            compacted_bytes,
            live_entries: self.index.entry_count(),
        };
        debug!(
            "Compacted {}: {} -> {} bytes, {} live entries",
            image.display(),
            result.original_bytes,
            result.compacted_bytes,
            result.live_entries
        );
        Ok(result)
    }
}

impl Partition for FilePartition {
    fn init(&mut self) -> PartitionResult<()> {
        let image = self.image_path();
        self.handles.clear();
        self.index.clear();
        self.wal = None;

        let existing_len = match fs::metadata(&image) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(PartitionError::io(&image, e, "Failed to stat partition image")),
        };

        if existing_len < PARTITION_HEADER_SIZE as u64 {
            if existing_len > 0 {
                warn!("Partition image {} holds a partial header, reformatting", image.display());
            }
            self.wal = Some(WalWriter::create(&image)?);
            sync_dir(&self.dir).map_err(|e| {
                PartitionError::io(&self.dir, e, "Failed to sync partition directory")
            })?;
            info!("Formatted partition image {}", image.display());
            return Ok(());
        }

        let recovery = WalReader::new(&image).recover()?;

        let used_bytes = recovery.valid_len;
        let usable_bytes = self.config.usable_bytes();
        if used_bytes > usable_bytes {
            return Err(PartitionError::NoFreePages { used_bytes, usable_bytes });
        }

        let mut index = Index::new();
        for batch in &recovery.batches {
            for record in batch {
                index.apply(record);
            }
        }
        if recovery.dropped_records > 0 {
            warn!(
                "Dropped {} uncommitted or corrupt records from {}",
                recovery.dropped_records,
                image.display()
            );
        }
        debug!(
            "Replayed {} batches, {} live entries from {}",
            recovery.batches.len(),
            index.entry_count(),
            image.display()
        );

        self.wal = Some(WalWriter::resume(&image, recovery.valid_len)?);
        self.index = index;
        Ok(())
    }

    fn erase_partition(&mut self) -> PartitionResult<()> {
        self.wal = None;
        self.handles.clear();
        self.index.clear();

        let image = self.image_path();
        match fs::remove_file(&image) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PartitionError::io(&image, e, "Failed to erase partition image")),
        }
        sync_dir(&self.dir).map_err(|e| {
            PartitionError::io(&self.dir, e, "Failed to sync partition directory")
        })?;
        info!("Erased partition image {}", image.display());
        Ok(())
    }

    fn open(&mut self, namespace: &str, mode: OpenMode) -> PartitionResult<HandleId> {
        self.ensure_initialized()?;
        validate_name(namespace, self.config.max_name_len)?;
        if mode == OpenMode::ReadOnly && !self.index.contains_namespace(namespace) {
            return Err(PartitionError::NotFound {
                namespace: namespace.to_string(),
                key: String::new(),
            });
        }
        let id = self.handles.open(namespace, mode);
        trace!("Opened {} handle {} on '{}'", mode, id, namespace);
        Ok(id)
    }

    fn get_u32(&mut self, handle: HandleId, key: &str) -> PartitionResult<u32> {
        self.ensure_initialized()?;
        validate_name(key, self.config.max_name_len)?;
        self.handles.get_u32(&self.index, handle, key)
    }

    fn set_u32(&mut self, handle: HandleId, key: &str, value: u32) -> PartitionResult<()> {
        self.ensure_initialized()?;
        validate_name(key, self.config.max_name_len)?;
        self.handles.stage_set(handle, key, value)
    }

    fn erase_key(&mut self, handle: HandleId, key: &str) -> PartitionResult<()> {
        self.ensure_initialized()?;
        validate_name(key, self.config.max_name_len)?;
        self.handles.stage_erase_key(&self.index, handle, key)
    }

    fn erase_all(&mut self, handle: HandleId) -> PartitionResult<()> {
        self.ensure_initialized()?;
        self.handles.stage_erase_all(handle)
    }

    fn commit(&mut self, handle: HandleId) -> PartitionResult<()> {
        self.ensure_initialized()?;
        let batch = self.handles.pending(handle)?.to_vec();
        if batch.is_empty() {
            return Ok(());
        }

        let required = encode_batch(&batch)?.len() as u64;
        let usable = self.config.usable_bytes();
        if self.used_bytes() + required > usable {
            self.compact()?;
            let used = self.used_bytes();
            if used + required > usable {
                return Err(PartitionError::NotEnoughSpace {
                    required,
                    available: usable.saturating_sub(used),
                });
            }
        }

        let wal = self.wal_mut()?;
        if let Err(e) = wal.append_batch(&batch) {
            if wal.is_poisoned() {
                error!(
                    "Partition image {} is unwritable until init: {}",
                    self.image_path().display(),
                    e
                );
                self.wal = None;
            }
            return Err(e);
        }
        for record in &batch {
            self.index.apply(record);
        }
        self.handles.clear_pending(handle);
        Ok(())
    }

    fn close(&mut self, handle: HandleId) {
        if self.handles.close(handle).is_some() {
            trace!("Closed handle {}", handle);
        }
    }

    fn max_name_len(&self) -> usize {
        self.config.max_name_len
    }
}

impl std::fmt::Debug for FilePartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePartition")
            .field("dir", &self.dir)
            .field("entries", &self.index.entry_count())
            .field("initialized", &self.wal.is_some())
            .finish()
    }
}
