//! nvmstore — persistent u32 key-value store for flash-backed devices
//!
//! A thin boundary between application code and a non-volatile partition:
//! initialize once, then write, read, erase and erase-all string keys holding
//! `u32` values.
//!
//! # Guarantees
//!
//! - **Recovery**: a partition written by incompatible software, or with no
//!   free pages, is erased and reinitialized once at startup; anything else
//!   that stops initialization is fatal
//! - **Sessions**: each call opens exactly one handle and releases it before
//!   returning, on every path
//! - **Defaults**: reading a key that was never written yields `0`
//! - **Commit failures** are reported as such; whether the mutation survived is
//!   unspecified
//!
//! ```
//! use nvmstore::{Kvs, StoreConfig};
//! use nvmstore_core::{MemPartition, PartitionConfig};
//!
//! let partition = MemPartition::new(PartitionConfig::default());
//! let mut kvs = Kvs::initialize(partition, StoreConfig::default()).unwrap();
//!
//! kvs.write("boot_count", 1).unwrap();
//! assert_eq!(kvs.read("boot_count").unwrap(), 1);
//! assert_eq!(kvs.read("unset").unwrap(), 0);
//! ```

pub mod config;
pub mod error;
pub mod handle;
pub mod store;

pub use config::StoreConfig;
pub use error::{InitStage, KvsError, KvsResult};
pub use handle::StoreHandle;
pub use store::{Kvs, DEFAULT_VALUE};
