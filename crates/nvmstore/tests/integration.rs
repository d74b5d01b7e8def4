//! Integration tests: the store over both partition implementations.
//!
//! Scenarios run against the RAM partition and the file-backed partition,
//! then reboot onto the same storage to check what survives.

use std::sync::Arc;

use nvmstore::{InitStage, Kvs, KvsError, StoreConfig};
use nvmstore_core::{
    FaultPoint, FilePartition, MemPartition, Partition, PartitionConfig, PartitionError,
    SharedFlash, FORMAT_VERSION,
};
use parking_lot::Mutex;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn mem_store() -> Kvs<MemPartition> {
    Kvs::initialize(MemPartition::new(PartitionConfig::default()), StoreConfig::default()).unwrap()
}

fn file_store(dir: &TempDir) -> Kvs<FilePartition> {
    let partition = FilePartition::open(dir.path(), PartitionConfig::default()).unwrap();
    Kvs::initialize(partition, StoreConfig::default()).unwrap()
}

/// The end-to-end scenario every partition must pass
fn run_scenario<P: Partition>(kvs: &mut Kvs<P>) {
    kvs.write("temp", 42).unwrap();
    assert_eq!(kvs.read("temp").unwrap(), 42);

    kvs.erase("temp").unwrap();
    assert_eq!(kvs.read("temp").unwrap(), 0);

    let err = kvs.erase("missing_key").unwrap_err();
    assert!(matches!(err, KvsError::KeyNotFound { .. }));

    kvs.write("a", 1).unwrap();
    kvs.write("b", 2).unwrap();
    kvs.erase_all().unwrap();
    assert_eq!(kvs.read("a").unwrap(), 0);
    assert_eq!(kvs.read("b").unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

#[test]
fn test_scenario_mem() {
    let mut kvs = mem_store();
    run_scenario(&mut kvs);
    assert_eq!(kvs.partition().open_handles(), 0);
}

#[test]
fn test_scenario_file() {
    let dir = TempDir::new().unwrap();
    let mut kvs = file_store(&dir);
    run_scenario(&mut kvs);
    assert_eq!(kvs.partition().open_handles(), 0);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn test_write_then_read_returns_value() {
    let mut kvs = mem_store();
    for (i, value) in [0u32, 1, 42, 0xDEAD_BEEF, u32::MAX].into_iter().enumerate() {
        let key = format!("key{}", i);
        kvs.write(&key, value).unwrap();
        assert_eq!(kvs.read(&key).unwrap(), value);
    }
}

#[test]
fn test_overwrite_keeps_last() {
    let mut kvs = mem_store();
    kvs.write("k", 1).unwrap();
    kvs.write("k", 2).unwrap();
    assert_eq!(kvs.read("k").unwrap(), 2);
    assert_eq!(kvs.partition().flash().entry_count(), 1);
}

#[test]
fn test_erase_is_not_idempotent() {
    let mut kvs = mem_store();
    kvs.write("k", 1).unwrap();
    kvs.erase("k").unwrap();
    assert!(matches!(kvs.erase("k"), Err(KvsError::KeyNotFound { .. })));
}

#[test]
fn test_max_length_key_accepted() {
    let mut kvs = mem_store();
    let key = "k".repeat(15);
    kvs.write(&key, 5).unwrap();
    assert_eq!(kvs.read(&key).unwrap(), 5);
    assert!(matches!(kvs.write(&"k".repeat(16), 5), Err(KvsError::InvalidKey { .. })));
}

#[test]
fn test_namespaces_are_isolated() {
    let flash = SharedFlash::new();
    let mut app = Kvs::initialize(
        MemPartition::with_flash(flash.clone(), PartitionConfig::default()),
        StoreConfig::with_namespace("app"),
    )
    .unwrap();
    app.write("k", 1).unwrap();
    drop(app);

    let mut other = Kvs::initialize(
        MemPartition::with_flash(flash, PartitionConfig::default()),
        StoreConfig::with_namespace("other"),
    )
    .unwrap();
    assert_eq!(other.read("k").unwrap(), 0);
    other.erase_all().unwrap();
}

// ---------------------------------------------------------------------------
// Reboot
// ---------------------------------------------------------------------------

#[test]
fn test_committed_values_survive_reboot_mem() {
    let flash = SharedFlash::new();
    {
        let mut kvs = Kvs::initialize(
            MemPartition::with_flash(flash.clone(), PartitionConfig::default()),
            StoreConfig::default(),
        )
        .unwrap();
        kvs.write("example_key2", 86554).unwrap();
        kvs.write("example_key3", 45874).unwrap();
    }

    let partition = MemPartition::with_flash(flash, PartitionConfig::default());
    let mut kvs = Kvs::initialize(partition, StoreConfig::default()).unwrap();
    assert_eq!(kvs.read("example_key2").unwrap(), 86554);
    assert_eq!(kvs.read("example_key3").unwrap(), 45874);
}

#[test]
fn test_committed_values_survive_reboot_file() {
    let dir = TempDir::new().unwrap();
    {
        let mut kvs = file_store(&dir);
        kvs.write("example_key", 12345).unwrap();
        kvs.write("gone", 1).unwrap();
        kvs.erase("gone").unwrap();
    }

    let mut kvs = file_store(&dir);
    assert_eq!(kvs.read("example_key").unwrap(), 12345);
    assert_eq!(kvs.read("gone").unwrap(), 0);
}

#[test]
fn test_erase_all_survives_reboot_file() {
    let dir = TempDir::new().unwrap();
    {
        let mut kvs = file_store(&dir);
        kvs.write("a", 1).unwrap();
        kvs.erase_all().unwrap();
    }
    let mut kvs = file_store(&dir);
    assert_eq!(kvs.read("a").unwrap(), 0);
    assert_eq!(kvs.partition().entry_count(), 0);
}

#[test]
fn test_many_writes_fit_through_compaction() {
    let dir = TempDir::new().unwrap();
    let partition = FilePartition::open(dir.path(), PartitionConfig::minimal()).unwrap();
    let mut kvs = Kvs::initialize(partition, StoreConfig::default()).unwrap();

    for round in 0..300u32 {
        for k in 0..4 {
            kvs.write(&format!("sensor{}", k), round * 10 + k).unwrap();
        }
    }
    drop(kvs);

    let partition = FilePartition::open(dir.path(), PartitionConfig::minimal()).unwrap();
    let mut kvs = Kvs::initialize(partition, StoreConfig::default()).unwrap();
    assert_eq!(kvs.read("sensor3").unwrap(), 2993);
}

// ---------------------------------------------------------------------------
// Initialize recovery
// ---------------------------------------------------------------------------

#[test]
fn test_incompatible_format_erased_and_retried_mem() {
    let flash = SharedFlash::with_version(FORMAT_VERSION - 1);
    let partition = MemPartition::with_flash(flash.clone(), PartitionConfig::default());
    let kvs = Kvs::initialize(partition, StoreConfig::default()).unwrap();

    assert_eq!(kvs.partition().stats().erase_partition_calls, 1);
    assert_eq!(kvs.partition().stats().init_calls, 2);
    assert_eq!(flash.version(), Some(FORMAT_VERSION));
}

#[test]
fn test_incompatible_format_erased_and_retried_file() {
    let dir = TempDir::new().unwrap();
    {
        let mut kvs = file_store(&dir);
        kvs.write("old", 1).unwrap();
    }

    // Rewrite the header as a different software version would have left it
    let image = dir.path().join(nvmstore_core::file::IMAGE_FILE);
    let mut bytes = std::fs::read(&image).unwrap();
    let stale = nvmstore_core::format::PartitionHeader { version: FORMAT_VERSION + 7 }.to_bytes();
    bytes[..stale.len()].copy_from_slice(&stale);
    std::fs::write(&image, bytes).unwrap();

    let mut kvs = file_store(&dir);
    assert_eq!(kvs.read("old").unwrap(), 0);
    kvs.write("new", 2).unwrap();
    assert_eq!(kvs.read("new").unwrap(), 2);
}

#[test]
fn test_truncated_partition_erased_file() {
    let dir = TempDir::new().unwrap();
    {
        let partition = FilePartition::open(dir.path(), PartitionConfig::large()).unwrap();
        let mut kvs = Kvs::initialize(partition, StoreConfig::default()).unwrap();
        for i in 0..300 {
            kvs.write(&format!("k{}", i), i).unwrap();
        }
    }

    // Same directory, smaller partition: the contents no longer fit
    let partition = FilePartition::open(dir.path(), PartitionConfig::minimal()).unwrap();
    let mut kvs = Kvs::initialize(partition, StoreConfig::default()).unwrap();
    assert_eq!(kvs.read("k1").unwrap(), 0);
}

#[test]
fn test_recovery_retry_failure_is_fatal() {
    let mut partition = MemPartition::new(PartitionConfig::default());
    for _ in 0..2 {
        let full = PartitionError::NoFreePages { used_bytes: 9, usable_bytes: 1 };
        partition.faults().inject(FaultPoint::Init, full);
    }

    let err = Kvs::initialize(partition, StoreConfig::default()).unwrap_err();
    match err {
        KvsError::PartitionUnusable { stage, source } => {
            assert_eq!(stage, InitStage::RetryInit);
            assert!(source.is_recoverable_by_erase());
        }
        other => panic!("Expected PartitionUnusable, got {:?}", other),
    }
}

#[test]
fn test_corrupt_image_is_fatal_without_erase() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join(nvmstore_core::file::IMAGE_FILE);
    std::fs::write(&image, [0x5Au8; 128]).unwrap();

    let partition = FilePartition::open(dir.path(), PartitionConfig::default()).unwrap();
    let err = Kvs::initialize(partition, StoreConfig::default()).unwrap_err();
    assert!(matches!(err, KvsError::PartitionUnusable { stage: InitStage::FirstInit, .. }));
    assert!(image.exists(), "a non-stale failure must not erase the partition");
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[test]
fn test_no_handle_leaks_on_any_failure() {
    let mut kvs = mem_store();
    kvs.write("k", 1).unwrap();

    let faults = [
        (FaultPoint::Set, "set"),
        (FaultPoint::Commit, "commit"),
        (FaultPoint::Get, "get"),
        (FaultPoint::EraseKey, "erase"),
        (FaultPoint::EraseAll, "erase_all"),
    ];
    for (point, what) in faults {
        kvs.partition_mut().faults().inject(point, PartitionError::Injected(what.to_string()));
    }

    assert!(kvs.write("k", 2).is_err());
    assert!(kvs.write("k", 3).is_err());
    assert!(kvs.read("k").is_err());
    assert!(kvs.erase("k").is_err());
    assert!(kvs.erase_all().is_err());

    assert_eq!(kvs.partition().open_handles(), 0);
    let stats = kvs.partition().stats();
    assert_eq!(stats.opens, stats.closes);
    assert_eq!(stats.max_open_handles, 1);
}

#[test]
fn test_commit_full_partition_reports_failure() {
    let mut config = PartitionConfig::minimal();
    config.page_size = 512;
    let mut kvs = Kvs::initialize(MemPartition::new(config), StoreConfig::default()).unwrap();

    let mut failure = None;
    for i in 0..100 {
        if let Err(e) = kvs.write(&format!("k{}", i), i) {
            failure = Some(e);
            break;
        }
    }
    let err = failure.expect("partition should fill up");
    assert!(err.durability_unspecified());
    assert!(matches!(err.partition_error(), Some(PartitionError::NotEnoughSpace { .. })));
}

// ---------------------------------------------------------------------------
// External serialization
// ---------------------------------------------------------------------------

#[test]
fn test_shared_store_behind_mutex() {
    let kvs = Arc::new(Mutex::new(mem_store()));

    let mut workers = vec![];
    for t in 0..4u32 {
        let kvs = Arc::clone(&kvs);
        workers.push(std::thread::spawn(move || {
            for i in 0..25u32 {
                kvs.lock().write(&format!("t{}k{}", t, i), t * 100 + i).unwrap();
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }

    let mut kvs = kvs.lock();
    assert_eq!(kvs.read("t3k24").unwrap(), 324);
    assert_eq!(kvs.partition().stats().max_open_handles, 1);
}
