//! The key-value store.
//!
//! Every operation runs one bounded session against the partition:
//! open handle → act → commit (mutations only) → release. The handle is an
//! RAII guard, so it is released on every exit path, including errors.

use log::{error, info, warn};
use nvmstore_core::{validate_name, OpenMode, Partition, PartitionError};

use crate::config::StoreConfig;
use crate::error::{InitStage, KvsError, KvsResult};
use crate::handle::StoreHandle;

/// Value `read` yields for a key that is not stored
pub const DEFAULT_VALUE: u32 = 0;

/// Persistent u32 key-value store over a `Partition`.
///
/// Exists only once the partition has been initialized, so no operation can
/// run against an unprepared partition. Operations take `&mut self`; callers on
/// several threads must serialize them (e.g. behind a `Mutex<Kvs<P>>`).
#[derive(Debug)]
pub struct Kvs<P: Partition> {
    partition: P,
    config: StoreConfig,
}

/// Log an error on its way out; logging never replaces the returned error.
fn report(err: KvsError) -> KvsError {
    error!("{}", err);
    err
}

impl<P: Partition> Kvs<P> {
    /// Bring the partition into a usable state and wrap it in a store.
    ///
    /// If the first `init` reports a stale partition (layout version mismatch,
    /// or no free pages), the whole partition is erased and `init` retried
    /// exactly once. Every other failure, and any failure of the erase or the
    /// retry, is fatal and returned as `PartitionUnusable`.
    pub fn initialize(mut partition: P, config: StoreConfig) -> KvsResult<Self> {
        config.validate(partition.max_name_len()).map_err(|reason| {
            report(KvsError::PartitionUnusable {
                stage: InitStage::FirstInit,
                source: PartitionError::InvalidName { name: config.namespace.clone(), reason },
            })
        })?;

        match partition.init() {
            Ok(()) => {}
            Err(e) if e.is_recoverable_by_erase() => {
                warn!("Partition needs erasing ({}), erasing and reinitializing", e);
                partition.erase_partition().map_err(|source| {
                    report(KvsError::PartitionUnusable { stage: InitStage::Erase, source })
                })?;
                partition.init().map_err(|source| {
                    report(KvsError::PartitionUnusable { stage: InitStage::RetryInit, source })
                })?;
            }
            Err(source) => {
                return Err(report(KvsError::PartitionUnusable {
                    stage: InitStage::FirstInit,
                    source,
                }));
            }
        }

        info!("Partition initialized successfully");
        Ok(Self { partition, config })
    }

    /// `initialize`, aborting the process if the partition is unusable.
    ///
    /// For firmware entry points where there is nothing sensible to do
    /// without persistent storage.
    pub fn initialize_or_abort(partition: P, config: StoreConfig) -> Self {
        match Self::initialize(partition, config) {
            Ok(store) => store,
            Err(e) => {
                error!("Aborting: {}", e);
                std::process::abort()
            }
        }
    }

    fn check_key(&self, key: &str) -> KvsResult<()> {
        validate_name(key, self.config.max_key_len).map_err(|e| {
            let reason = match e {
                PartitionError::InvalidName { reason, .. } => reason,
                other => other.to_string(),
            };
            report(KvsError::InvalidKey { key: key.to_string(), reason })
        })
    }

    fn acquire(&mut self, mode: OpenMode) -> KvsResult<StoreHandle<'_, P>> {
        StoreHandle::acquire(&mut self.partition, &self.config.namespace, mode)
            .map_err(|source| report(KvsError::HandleAcquisitionFailed { mode, source }))
    }

    /// Durably store `value` under `key`, overwriting any previous value.
    pub fn write(&mut self, key: &str, value: u32) -> KvsResult<()> {
        self.check_key(key)?;
        let mut handle = self.acquire(OpenMode::ReadWrite)?;

        handle.set_u32(key, value).map_err(|source| {
            report(KvsError::WriteFailed { key: key.to_string(), source })
        })?;
        handle.commit().map_err(|source| report(KvsError::CommitFailed { source }))?;

        info!("Value ({}) written with key '{}'", value, key);
        Ok(())
    }

    /// Value stored under `key`, or `DEFAULT_VALUE` if there is none.
    ///
    /// Absence is not an error. A fault while looking the key up is.
    pub fn read(&mut self, key: &str) -> KvsResult<u32> {
        self.check_key(key)?;

        let namespace = &self.config.namespace;
        let acquired = StoreHandle::acquire(&mut self.partition, namespace, OpenMode::ReadOnly);
        let mut handle = match acquired {
            Ok(handle) => handle,
            // Nothing was ever committed to the namespace
            Err(e) if e.is_not_found() => {
                warn!(
                    "Key '{}' not found in '{}', using default {}",
                    key, namespace, DEFAULT_VALUE
                );
                return Ok(DEFAULT_VALUE);
            }
            Err(source) => {
                return Err(report(KvsError::HandleAcquisitionFailed {
                    mode: OpenMode::ReadOnly,
                    source,
                }));
            }
        };

        match handle.get_u32(key) {
            Ok(value) => {
                info!("Value read with key '{}': {}", key, value);
                Ok(value)
            }
            Err(e) if e.is_not_found() => {
                warn!("Key '{}' not found, using default {}", key, DEFAULT_VALUE);
                Ok(DEFAULT_VALUE)
            }
            Err(source) => Err(report(KvsError::ReadFailed { key: key.to_string(), source })),
        }
    }

    /// Durably remove `key`.
    ///
    /// Unlike `read`, a missing key is reported (`KeyNotFound`), so erasing
    /// twice fails the second time.
    pub fn erase(&mut self, key: &str) -> KvsResult<()> {
        self.check_key(key)?;
        let mut handle = self.acquire(OpenMode::ReadWrite)?;

        handle.erase_key(key).map_err(|source| {
            if source.is_not_found() {
                report(KvsError::KeyNotFound { key: key.to_string() })
            } else {
                report(KvsError::EraseFailed { key: Some(key.to_string()), source })
            }
        })?;
        handle.commit().map_err(|source| report(KvsError::CommitFailed { source }))?;

        info!("Key '{}' erased", key);
        Ok(())
    }

    /// Durably remove every entry of the store's namespace.
    pub fn erase_all(&mut self) -> KvsResult<()> {
        let mut handle = self.acquire(OpenMode::ReadWrite)?;

        handle.erase_all().map_err(|source| report(KvsError::EraseFailed { key: None, source }))?;
        handle.commit().map_err(|source| report(KvsError::CommitFailed { source }))?;

        info!("All keys erased");
        Ok(())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn partition(&self) -> &P {
        &self.partition
    }

    /// Direct access to the partition, for diagnostics and fault injection.
    /// Handles opened through it are the caller's to close.
    pub fn partition_mut(&mut self) -> &mut P {
        &mut self.partition
    }

    pub fn into_partition(self) -> P {
        self.partition
    }
}
