//! Binary format of a partition image
//!
//! An image is a `PartitionHeader` (32 bytes) followed by records:
//! RecordHeader (16 bytes) + ns_len(u8) + key_len(u8) + value(u32 LE) + namespace + key
//!
//! Records are written in batches terminated by a `Commit` record whose value
//! is the number of records in the batch.

use std::path::PathBuf;

use crate::error::{PartitionError, PartitionResult};

/// Magic bytes opening every partition image: "NVSP"
pub const PARTITION_MAGIC: [u8; 4] = *b"NVSP";

/// Magic bytes opening every record: "NVSR"
pub const RECORD_MAGIC: [u8; 4] = *b"NVSR";

/// On-media layout version written by this build
pub const FORMAT_VERSION: u32 = 2;

/// Partition header size in bytes
pub const PARTITION_HEADER_SIZE: usize = 32;

/// Record header size in bytes
pub const RECORD_HEADER_SIZE: usize = 16;

/// Fixed payload prefix: ns_len(1) + key_len(1) + value(4)
const PAYLOAD_FIXED_SIZE: usize = 6;

/// Record types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Insert or overwrite a u32 entry
    Set = 1,
    /// Remove one entry
    EraseKey = 2,
    /// Remove every entry of a namespace (the namespace itself survives)
    EraseNamespace = 3,
    /// Closes a batch
    Commit = 4,
}

impl RecordType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RecordType::Set),
            2 => Some(RecordType::EraseKey),
            3 => Some(RecordType::EraseNamespace),
            4 => Some(RecordType::Commit),
            _ => None,
        }
    }
}

/// One logged mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Set { namespace: String, key: String, value: u32 },
    EraseKey { namespace: String, key: String },
    EraseNamespace { namespace: String },
    Commit { count: u32 },
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        match self {
            Record::Set { .. } => RecordType::Set,
            Record::EraseKey { .. } => RecordType::EraseKey,
            Record::EraseNamespace { .. } => RecordType::EraseNamespace,
            Record::Commit { .. } => RecordType::Commit,
        }
    }

    fn parts(&self) -> (&str, &str, u32) {
        match self {
            Record::Set { namespace, key, value } => (namespace, key, *value),
            Record::EraseKey { namespace, key } => (namespace, key, 0),
            Record::EraseNamespace { namespace } => (namespace, "", 0),
            Record::Commit { count } => ("", "", *count),
        }
    }

    /// Size of this record once encoded, header included
    pub fn encoded_len(&self) -> usize {
        let (ns, key, _) = self.parts();
        RECORD_HEADER_SIZE + PAYLOAD_FIXED_SIZE + ns.len() + key.len()
    }
}

/// Header at offset 0 of a partition image
///
/// Layout:
///   [0..4]   magic:    "NVSP"
///   [4..8]   version:  u32 LE
///   [8..12]  checksum: u32 LE, CRC32C of bytes [0..8]
///   [12..32] reserved, zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionHeader {
    pub version: u32,
}

impl PartitionHeader {
    /// Header for the layout this build writes
    pub fn current() -> Self {
        Self { version: FORMAT_VERSION }
    }

    pub fn to_bytes(&self) -> [u8; PARTITION_HEADER_SIZE] {
        let mut buf = [0u8; PARTITION_HEADER_SIZE];
        buf[0..4].copy_from_slice(&PARTITION_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        let checksum = crc32c::crc32c(&buf[0..8]);
        buf[8..12].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parse and verify a header. The version is returned as stored; comparing
    /// it against `FORMAT_VERSION` is the caller's decision.
    pub fn from_bytes(bytes: &[u8; PARTITION_HEADER_SIZE]) -> PartitionResult<Self> {
        if bytes[0..4] != PARTITION_MAGIC {
            return Err(PartitionError::Corrupted {
                path: PathBuf::from("<header>"),
                offset: 0,
                reason: format!(
                    "bad partition magic {:02x}{:02x}{:02x}{:02x}",
                    bytes[0], bytes[1], bytes[2], bytes[3]
                ),
            });
        }
        let stored = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let computed = crc32c::crc32c(&bytes[0..8]);
        if stored != computed {
            return Err(PartitionError::ChecksumMismatch {
                expected: stored,
                actual: computed,
                offset: 0,
            });
        }
        Ok(Self {
            version: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

/// Fixed-size header for each record
///
/// Layout:
///   [0..4]   magic:       "NVSR"
///   [4..8]   length:      u32 - payload length in bytes
///   [8..12]  checksum:    u32 - CRC32C of payload bytes
///   [12]     record_type: u8
///   [13..16] reserved
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub record_type: u8,
}

impl RecordHeader {
    pub fn new(length: u32, checksum: u32, record_type: RecordType) -> Self {
        Self {
            magic: RECORD_MAGIC,
            length,
            checksum,
            record_type: record_type as u8,
        }
    }

    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.record_type;
        buf
    }

    pub fn from_bytes(bytes: &[u8; RECORD_HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Self {
            magic,
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            record_type: bytes[12],
        }
    }
}

/// Encode one record, header included
pub fn encode_record(record: &Record) -> PartitionResult<Vec<u8>> {
    let (ns, key, value) = record.parts();
    for name in [ns, key] {
        if name.len() > u8::MAX as usize {
            return Err(PartitionError::InvalidName {
                name: name.to_string(),
                reason: format!("{} bytes does not fit a one-byte length", name.len()),
            });
        }
    }

    let mut payload = Vec::with_capacity(PAYLOAD_FIXED_SIZE + ns.len() + key.len());
    payload.push(ns.len() as u8);
    payload.push(key.len() as u8);
    payload.extend_from_slice(&value.to_le_bytes());
    payload.extend_from_slice(ns.as_bytes());
    payload.extend_from_slice(key.as_bytes());

    let header = RecordHeader::new(
        payload.len() as u32,
        crc32c::crc32c(&payload),
        record.record_type(),
    );

    let mut buffer = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    buffer.extend_from_slice(&header.to_bytes());
    buffer.extend_from_slice(&payload);
    Ok(buffer)
}

/// Encode a batch followed by its `Commit` record
pub fn encode_batch(batch: &[Record]) -> PartitionResult<Vec<u8>> {
    let mut buffer = Vec::new();
    for record in batch {
        buffer.extend_from_slice(&encode_record(record)?);
    }
    buffer.extend_from_slice(&encode_record(&Record::Commit { count: batch.len() as u32 })?);
    Ok(buffer)
}

fn corrupted(offset: usize, reason: String) -> PartitionError {
    PartitionError::Corrupted {
        path: PathBuf::from("<buffer>"),
        offset: offset as u64,
        reason,
    }
}

/// Decode one record from the start of `data`
pub fn decode_record(data: &[u8]) -> PartitionResult<Record> {
    let header_bytes: [u8; RECORD_HEADER_SIZE] = match data.get(..RECORD_HEADER_SIZE) {
        Some(slice) => slice.try_into().map_err(|_| corrupted(0, "header slice".into()))?,
        None => {
            return Err(corrupted(
                0,
                format!(
                    "record too short: {} bytes, need at least {}",
                    data.len(),
                    RECORD_HEADER_SIZE
                ),
            ))
        }
    };
    let header = RecordHeader::from_bytes(&header_bytes);

    if header.magic != RECORD_MAGIC {
        return Err(corrupted(0, "bad record magic".into()));
    }

    let payload_end = RECORD_HEADER_SIZE + header.length as usize;
    if data.len() < payload_end {
        return Err(PartitionError::TornWrite {
            expected_size: header.length,
            available_bytes: (data.len() - RECORD_HEADER_SIZE) as u64,
            offset: RECORD_HEADER_SIZE as u64,
        });
    }
    let payload = &data[RECORD_HEADER_SIZE..payload_end];

    let computed = crc32c::crc32c(payload);
    if computed != header.checksum {
        return Err(PartitionError::ChecksumMismatch {
            expected: header.checksum,
            actual: computed,
            offset: RECORD_HEADER_SIZE as u64,
        });
    }

    if payload.len() < PAYLOAD_FIXED_SIZE {
        return Err(corrupted(RECORD_HEADER_SIZE, "payload too short for fixed fields".into()));
    }
    let ns_len = payload[0] as usize;
    let key_len = payload[1] as usize;
    let value = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]);
    let ns_end = PAYLOAD_FIXED_SIZE + ns_len;
    let key_end = ns_end + key_len;
    if payload.len() != key_end {
        return Err(corrupted(
            RECORD_HEADER_SIZE,
            format!("payload is {} bytes, names need {}", payload.len(), key_end),
        ));
    }

    let text = |range: std::ops::Range<usize>| {
        String::from_utf8(payload[range].to_vec())
            .map_err(|_| corrupted(RECORD_HEADER_SIZE, "name is not UTF-8".into()))
    };
    let namespace = text(PAYLOAD_FIXED_SIZE..ns_end)?;
    let key = text(ns_end..key_end)?;

    match RecordType::from_u8(header.record_type) {
        Some(RecordType::Set) => Ok(Record::Set { namespace, key, value }),
        Some(RecordType::EraseKey) => Ok(Record::EraseKey { namespace, key }),
        Some(RecordType::EraseNamespace) => Ok(Record::EraseNamespace { namespace }),
        Some(RecordType::Commit) => Ok(Record::Commit { count: value }),
        None => Err(corrupted(12, format!("invalid record type: {}", header.record_type))),
    }
}
