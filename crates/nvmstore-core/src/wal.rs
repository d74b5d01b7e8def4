//! Append-only record log backing `FilePartition`
//!
//! Commit ordering:
//! 1. Encode the batch and its Commit record
//! 2. Append the bytes to the image
//! 3. durable_sync() the image
//! 4. Return; only now does the caller apply the batch to its index
//!
//! Replay applies a batch only once its Commit record has been read, so a
//! crash anywhere before step 3 completes loses the whole batch and nothing else.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, error, warn};

use crate::error::{PartitionError, PartitionResult};
use crate::format::{
    decode_record, encode_batch, PartitionHeader, Record, FORMAT_VERSION, PARTITION_HEADER_SIZE,
    RECORD_HEADER_SIZE, RECORD_MAGIC,
};
use crate::platform_durability::durable_sync;

/// Appends committed batches to a partition image.
///
/// INVARIANT: `append_batch()` returns Ok only after the bytes are durable,
/// and the caller must not touch its index before that.
///
/// INVARIANT: every append starts at `size`, the end of the last durable
/// Commit. Bytes past it (left by a failed append) are cut off first.
pub struct WalWriter {
    file: File,
    path: PathBuf,
    size: u64,
    /// Set when a failed append could not be rolled back
    poisoned: bool,
}

impl WalWriter {
    /// Create (or overwrite) an image holding only a fresh header.
    pub fn create<P: AsRef<Path>>(path: P) -> PartitionResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| PartitionError::io(&path, e, "Failed to create partition image"))?;

        file.write_all(&PartitionHeader::current().to_bytes())
            .map_err(|e| PartitionError::io(&path, e, "Failed to write partition header"))?;
        durable_sync(&file)
            .map_err(|e| PartitionError::io(&path, e, "Failed to sync partition header"))?;

        Ok(Self {
            file,
            path,
            size: PARTITION_HEADER_SIZE as u64,
            poisoned: false,
        })
    }

    /// Reopen an existing image for appending after replay.
    ///
    /// Everything past `valid_len` (a torn or uncommitted tail) is cut off so
    /// new batches are not hidden behind it on the next replay.
    pub fn resume<P: AsRef<Path>>(path: P, valid_len: u64) -> PartitionResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| PartitionError::io(&path, e, "Failed to open partition image"))?;

        let current = file
            .metadata()
            .map_err(|e| PartitionError::io(&path, e, "Failed to stat partition image"))?
            .len();
        if current > valid_len {
            debug!(
                "Truncating {} bytes of uncommitted tail from {}",
                current - valid_len,
                path.display()
            );
            file.set_len(valid_len)
                .map_err(|e| PartitionError::io(&path, e, "Failed to truncate partition image"))?;
            durable_sync(&file)
                .map_err(|e| PartitionError::io(&path, e, "Failed to sync truncation"))?;
        }
        file.seek(SeekFrom::Start(valid_len))
            .map_err(|e| PartitionError::io(&path, e, "Failed to seek partition image"))?;

        Ok(Self {
            file,
            path,
            size: valid_len,
            poisoned: false,
        })
    }

    /// Append a batch and its Commit record, then make them durable.
    ///
    /// On failure the image is cut back to the last durable Commit, so the
    /// next batch is never appended behind an unterminated one. If even that
    /// fails the writer is poisoned and refuses further appends.
    pub fn append_batch(&mut self, batch: &[Record]) -> PartitionResult<()> {
        if self.poisoned {
            return Err(PartitionError::NotInitialized);
        }
        let bytes = encode_batch(batch)?;
        self.discard_tail()?;

        if let Err(e) = self.write_durably(&bytes) {
            self.roll_back();
            return Err(e);
        }

        self.size += bytes.len() as u64;
        Ok(())
    }

    fn write_durably(&mut self, bytes: &[u8]) -> PartitionResult<()> {
        self.file
            .write_all(bytes)
            .map_err(|e| PartitionError::io(&self.path, e, "Partition write failed"))?;

        // After this returns Ok the batch survives power loss
        durable_sync(&self.file)
            .map_err(|e| PartitionError::io(&self.path, e, "Partition durable_sync failed"))
    }

    /// Truncate anything past `size` and position the cursor there.
    fn discard_tail(&mut self) -> PartitionResult<()> {
        let current = self
            .file
            .metadata()
            .map_err(|e| PartitionError::io(&self.path, e, "Failed to stat partition image"))?
            .len();
        if current > self.size {
            warn!(
                "Discarding {} bytes of unterminated batch from {}",
                current - self.size,
                self.path.display()
            );
            self.file
                .set_len(self.size)
                .map_err(|e| {
                    PartitionError::io(&self.path, e, "Failed to truncate partition image")
                })?;
            durable_sync(&self.file)
                .map_err(|e| PartitionError::io(&self.path, e, "Failed to sync truncation"))?;
        }
        self.file
            .seek(SeekFrom::Start(self.size))
            .map_err(|e| PartitionError::io(&self.path, e, "Failed to seek partition image"))?;
        Ok(())
    }

    fn roll_back(&mut self) {
        if let Err(e) = self.discard_tail() {
            error!("Cannot roll back failed append on {}: {}", self.path.display(), e);
            self.poisoned = true;
        }
    }

    /// True once a failed append could not be undone; only a fresh
    /// `resume` (after replay) makes the image writable again.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    #[cfg(test)]
    pub(crate) fn poison(&mut self) {
        self.poisoned = true;
    }

    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Image size in bytes, header included
    pub fn current_size(&self) -> u64 {
        self.size
    }
}

/// Outcome of replaying an image
#[derive(Debug)]
pub struct Recovery {
    /// Batches whose Commit record was read, in log order
    pub batches: Vec<Vec<Record>>,
    /// Offset just past the last complete Commit record
    pub valid_len: u64,
    /// Records discarded (corrupt, or belonging to an unfinished batch)
    pub dropped_records: usize,
}

/// Replays a partition image.
pub struct WalReader {
    path: PathBuf,
}

impl WalReader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    /// Verify the header and collect every committed batch.
    ///
    /// Per record:
    /// 1. Check the record magic, resync on the next magic if it is wrong
    /// 2. If the record runs past EOF: torn write, stop here
    /// 3. Decode and verify CRC32C, resync on failure
    /// 4. Buffer it; on a Commit whose count matches, the buffer becomes a batch
    ///
    /// A corrupt record poisons the batch it belongs to.
    pub fn recover(&self) -> PartitionResult<Recovery> {
        let mut file = File::open(&self.path).map_err(|e| {
            PartitionError::io(&self.path, e, "Failed to open partition image for replay")
        })?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)
            .map_err(|e| PartitionError::io(&self.path, e, "Failed to read partition image"))?;

        let header_bytes: [u8; PARTITION_HEADER_SIZE] = buffer
            .get(..PARTITION_HEADER_SIZE)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| PartitionError::Corrupted {
                path: self.path.clone(),
                offset: 0,
                reason: format!("image is {} bytes, shorter than its header", buffer.len()),
            })?;
        let header = PartitionHeader::from_bytes(&header_bytes).map_err(|e| match e {
            PartitionError::Corrupted { offset, reason, .. } => PartitionError::Corrupted {
                path: self.path.clone(),
                offset,
                reason,
            },
            other => other,
        })?;
        if header.version != FORMAT_VERSION {
            return Err(PartitionError::NewVersionFound {
                found: header.version,
                expected: FORMAT_VERSION,
            });
        }

        let mut batches = Vec::new();
        let mut pending: Vec<Record> = Vec::new();
        let mut dropped_records = 0;
        let mut valid_len = PARTITION_HEADER_SIZE;
        let mut offset = PARTITION_HEADER_SIZE;

        while offset + RECORD_HEADER_SIZE <= buffer.len() {
            if buffer[offset..offset + 4] != RECORD_MAGIC {
                warn!(
                    "Bad record magic at offset {} in {}, scanning for next record",
                    offset,
                    self.path.display()
                );
                dropped_records += pending.len();
                pending.clear();
                match find_next_magic(&buffer, offset + 1) {
                    Some(next) => {
                        offset = next;
                        continue;
                    }
                    None => break,
                }
            }

            let length = u32::from_le_bytes([
                buffer[offset + 4], buffer[offset + 5],
                buffer[offset + 6], buffer[offset + 7],
            ]) as usize;
            let total = RECORD_HEADER_SIZE + length;

            if offset + total > buffer.len() {
                // The crash point: nothing after this was ever completed
                debug!(
                    "Torn write at offset {}: need {} bytes, have {}",
                    offset,
                    total,
                    buffer.len() - offset
                );
                break;
            }

            match decode_record(&buffer[offset..offset + total]) {
                Ok(Record::Commit { count }) => {
                    if count as usize == pending.len() {
                        batches.push(std::mem::take(&mut pending));
                    } else {
                        warn!(
                            "Commit at offset {} closes {} records, {} were read; dropping batch",
                            offset,
                            count,
                            pending.len()
                        );
                        dropped_records += pending.len();
                        pending.clear();
                    }
                    offset += total;
                    valid_len = offset;
                }
                Ok(record) => {
                    pending.push(record);
                    offset += total;
                }
                Err(e) => {
                    warn!("Corrupt record at offset {} in {}: {}", offset, self.path.display(), e);
                    dropped_records += pending.len() + 1;
                    pending.clear();
                    match find_next_magic(&buffer, offset + 1) {
                        Some(next) => {
                            offset = next;
                            continue;
                        }
                        None => break,
                    }
                }
            }
        }
        dropped_records += pending.len();

        Ok(Recovery { batches, valid_len: valid_len as u64, dropped_records })
    }
}

/// Scan forward for the next record magic, for resynchronization after corruption.
fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    (start..buffer.len().saturating_sub(3)).find(|&i| buffer[i..i + 4] == RECORD_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set(key: &str, value: u32) -> Record {
        Record::Set { namespace: "storage".into(), key: key.into(), value }
    }

    fn image(dir: &TempDir) -> PathBuf {
        dir.path().join("partition.nvs")
    }

    #[test]
    fn test_fresh_image_has_no_batches() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::create(image(&dir)).unwrap();
        assert_eq!(writer.current_size(), PARTITION_HEADER_SIZE as u64);

        let recovery = WalReader::new(image(&dir)).recover().unwrap();
        assert!(recovery.batches.is_empty());
        assert_eq!(recovery.valid_len, PARTITION_HEADER_SIZE as u64);
    }

    #[test]
    fn test_batches_replay_in_order() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::create(image(&dir)).unwrap();
        writer.append_batch(&[set("a", 1), set("b", 2)]).unwrap();
        writer
            .append_batch(&[Record::EraseKey { namespace: "storage".into(), key: "a".into() }])
            .unwrap();
        let size = writer.current_size();
        drop(writer);

        let recovery = WalReader::new(image(&dir)).recover().unwrap();
        assert_eq!(recovery.batches.len(), 2);
        assert_eq!(recovery.batches[0], vec![set("a", 1), set("b", 2)]);
        assert_eq!(recovery.valid_len, size);
        assert_eq!(recovery.dropped_records, 0);
    }

    #[test]
    fn test_uncommitted_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::create(image(&dir)).unwrap();
        writer.append_batch(&[set("kept", 1)]).unwrap();
        let committed = writer.current_size();
        drop(writer);

        // A record written without its Commit: crash before commit completed
        let mut data = std::fs::read(image(&dir)).unwrap();
        data.extend_from_slice(&crate::format::encode_record(&set("lost", 2)).unwrap());
        std::fs::write(image(&dir), data).unwrap();

        let recovery = WalReader::new(image(&dir)).recover().unwrap();
        assert_eq!(recovery.batches, vec![vec![set("kept", 1)]]);
        assert_eq!(recovery.valid_len, committed);
        assert_eq!(recovery.dropped_records, 1);
    }

    #[test]
    fn test_torn_write_stops_cleanly() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::create(image(&dir)).unwrap();
        writer.append_batch(&[set("complete", 1)]).unwrap();
        drop(writer);

        let mut data = std::fs::read(image(&dir)).unwrap();
        data.extend_from_slice(&RECORD_MAGIC);
        data.extend_from_slice(&[0xFF, 0x00, 0x00, 0x00]);
        data.extend_from_slice(&[0u8; 8]);
        std::fs::write(image(&dir), data).unwrap();

        let recovery = WalReader::new(image(&dir)).recover().unwrap();
        assert_eq!(recovery.batches.len(), 1);
    }

    #[test]
    fn test_corrupt_batch_dropped_later_batch_kept() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::create(image(&dir)).unwrap();
        writer.append_batch(&[set("first", 1)]).unwrap();
        let second_start = writer.current_size() as usize;
        writer.append_batch(&[set("second", 2)]).unwrap();
        writer.append_batch(&[set("third", 3)]).unwrap();
        drop(writer);

        // Flip the last byte of the second batch's Set payload
        let mut data = std::fs::read(image(&dir)).unwrap();
        let corrupt_at = second_start + set("second", 2).encoded_len() - 1;
        data[corrupt_at] ^= 0xFF;
        std::fs::write(image(&dir), data).unwrap();

        let recovery = WalReader::new(image(&dir)).recover().unwrap();
        assert_eq!(recovery.batches, vec![vec![set("first", 1)], vec![set("third", 3)]]);
        assert!(recovery.dropped_records >= 1);
    }

    #[test]
    fn test_version_mismatch_reported() {
        let dir = TempDir::new().unwrap();
        let stale = PartitionHeader { version: FORMAT_VERSION - 1 }.to_bytes();
        std::fs::write(image(&dir), stale).unwrap();

        let err = WalReader::new(image(&dir)).recover().unwrap_err();
        assert!(matches!(
            err,
            PartitionError::NewVersionFound { found, .. } if found == FORMAT_VERSION - 1
        ));
    }

    #[test]
    fn test_resume_truncates_tail() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::create(image(&dir)).unwrap();
        writer.append_batch(&[set("a", 1)]).unwrap();
        let valid = writer.current_size();
        drop(writer);

        let mut data = std::fs::read(image(&dir)).unwrap();
        data.extend_from_slice(b"garbage");
        std::fs::write(image(&dir), data).unwrap();

        let mut writer = WalWriter::resume(image(&dir), valid).unwrap();
        writer.append_batch(&[set("b", 2)]).unwrap();
        drop(writer);

        let recovery = WalReader::new(image(&dir)).recover().unwrap();
        assert_eq!(recovery.batches, vec![vec![set("a", 1)], vec![set("b", 2)]]);
    }

    #[test]
    fn test_append_after_partial_batch_is_not_lost() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::create(image(&dir)).unwrap();
        writer.append_batch(&[set("a", 1)]).unwrap();

        // What an interrupted append leaves: a record with no Commit, and the
        // cursor past it
        let orphan = crate::format::encode_record(&set("x", 9)).unwrap();
        writer.file.write_all(&orphan).unwrap();

        writer.append_batch(&[set("b", 2)]).unwrap();
        let size = writer.current_size();
        drop(writer);

        assert_eq!(std::fs::metadata(image(&dir)).unwrap().len(), size);
        let recovery = WalReader::new(image(&dir)).recover().unwrap();
        assert_eq!(recovery.batches, vec![vec![set("a", 1)], vec![set("b", 2)]]);
        assert_eq!(recovery.dropped_records, 0);
    }

    #[test]
    fn test_failed_append_rolls_back() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::create(image(&dir)).unwrap();
        writer.append_batch(&[set("a", 1)]).unwrap();
        let committed = writer.current_size();

        // A handle that cannot write makes write_all fail
        writer.file = File::open(image(&dir)).unwrap();
        assert!(writer.append_batch(&[set("b", 2)]).is_err());
        assert_eq!(writer.current_size(), committed);
        assert!(!writer.is_poisoned());

        writer.file = OpenOptions::new().write(true).open(image(&dir)).unwrap();
        writer.append_batch(&[set("c", 3)]).unwrap();
        drop(writer);

        let recovery = WalReader::new(image(&dir)).recover().unwrap();
        assert_eq!(recovery.batches, vec![vec![set("a", 1)], vec![set("c", 3)]]);
    }

    #[test]
    fn test_poisoned_writer_refuses_appends() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::create(image(&dir)).unwrap();
        writer.poisoned = true;

        let err = writer.append_batch(&[set("a", 1)]).unwrap_err();
        assert!(matches!(err, PartitionError::NotInitialized));
        assert_eq!(std::fs::metadata(image(&dir)).unwrap().len(), PARTITION_HEADER_SIZE as u64);
    }
}
