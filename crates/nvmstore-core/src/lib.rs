//! nvmstore core — partition substrate
//!
//! The handle-scoped storage primitive the key-value store sits on: a
//! non-volatile region of u32 entries grouped in namespaces, accessed through
//! short-lived read-only or read-write handles whose mutations become durable
//! only at commit.
//!
//! # Implementations
//!
//! - **`MemPartition`**: RAM flash that survives simulated reboots, with
//!   per-call fault injection for exercising failure paths
//! - **`FilePartition`**: checksummed append-only image in a host directory,
//!   replayed at `init`, compacted when full
//!
//! Both detect the two stale-partition conditions at `init` time: a layout
//! version written by different software, and contents that no longer fit.

pub mod config;
pub mod error;
pub mod file;
pub mod format;
pub mod index;
pub mod mem;
pub mod partition;
pub mod platform_durability;
pub mod wal;

// Re-export key types for convenience
pub use config::PartitionConfig;
pub use error::{PartitionError, PartitionResult};
pub use file::{CompactionResult, FilePartition};
pub use format::{Record, FORMAT_VERSION};
pub use mem::{FaultPoint, MemPartition, MemStats, SharedFlash};
pub use partition::{validate_name, HandleId, OpenMode, Partition};
