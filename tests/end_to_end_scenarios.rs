//! Literal end-to-end scenarios over the public `sop` surface, one per
//! concrete case in the storage engine's testable-properties list: a single
//! insert-then-find, two non-colliding writers, a write-write conflict, a
//! read-write conflict, a crash mid-commit compensated by the sweeper, and
//! non-unique insertion-order traversal.

use sop::{
    recovery_sweeper, Backends, FindKind, SopError, Store, StoreOptions, TransactionMode,
};
use sop_durability::MemTransactionLog;
use sop_storage::{FifoDeferredGc, MemBlobStore, MemL2Cache, MemRegistry, MemStoreRepository};
use std::sync::Arc;
use std::time::Duration;

fn backends() -> Backends {
    Backends {
        registry: Arc::new(MemRegistry::new()),
        blob_store: Arc::new(MemBlobStore::new()),
        l1_cache: Arc::new(sop_storage::MruCache::new(256)),
        l2_cache: Arc::new(MemL2Cache::new()),
        store_repo: Arc::new(MemStoreRepository::new()),
        log: Arc::new(MemTransactionLog::new()),
        gc: Arc::new(FifoDeferredGc::new()),
    }
}

#[test]
fn single_insert_then_find() {
    let mut store = Store::new_btree("s1", StoreOptions::default(), backends()).unwrap();

    let mut tx = store.begin(TransactionMode::ForWriting).unwrap();
    tx.add(1u64.to_be_bytes().to_vec(), b"hello world".to_vec())
        .unwrap();
    tx.commit().unwrap();

    let mut tx = store.begin(TransactionMode::ForReading).unwrap();
    let cursor = tx
        .find(&1u64.to_be_bytes(), FindKind::Any)
        .unwrap()
        .expect("key 1 should be present");
    assert_eq!(tx.get_current_value(&cursor).unwrap(), b"hello world");
    assert_eq!(tx.count().unwrap(), 1);
}

#[test]
fn two_writers_no_collision_both_commit() {
    let mut store = Store::new_btree("s2", StoreOptions::default(), backends()).unwrap();

    // Seed with keys 1..5.
    let mut seed = store.begin(TransactionMode::ForWriting).unwrap();
    for k in 1u64..=5 {
        seed.add(k.to_be_bytes().to_vec(), b"seed".to_vec()).unwrap();
    }
    seed.commit().unwrap();

    let mut tx_a = store.begin(TransactionMode::ForWriting).unwrap();
    tx_a.add(6u64.to_be_bytes().to_vec(), b"a".to_vec()).unwrap();
    tx_a.phase1_commit().unwrap();

    let mut tx_b = store.begin(TransactionMode::ForWriting).unwrap();
    tx_b.add(7u64.to_be_bytes().to_vec(), b"b".to_vec()).unwrap();
    tx_b.phase1_commit().unwrap();

    tx_a.phase2_commit().unwrap();
    tx_b.phase2_commit().unwrap();

    let mut tx = store.begin(TransactionMode::ForReading).unwrap();
    assert_eq!(tx.count().unwrap(), 7);
    assert!(tx.find(&6u64.to_be_bytes(), FindKind::Any).unwrap().is_some());
    assert!(tx.find(&7u64.to_be_bytes(), FindKind::Any).unwrap().is_some());
}

#[test]
fn write_write_conflict_on_same_item_is_rejected() {
    let mut store = Store::new_btree("s3", StoreOptions::default(), backends()).unwrap();

    let mut seed = store.begin(TransactionMode::ForWriting).unwrap();
    seed.add(b"peter-parker".to_vec(), b"1234".to_vec()).unwrap();
    seed.commit().unwrap();

    let mut tx_a = store.begin(TransactionMode::ForWriting).unwrap();
    let cursor_a = tx_a.find(b"peter-parker", FindKind::Any).unwrap().unwrap();
    tx_a.update_current_value(&cursor_a, b"789".to_vec()).unwrap();

    let mut tx_b = store.begin(TransactionMode::ForWriting).unwrap();
    let cursor_b = tx_b.find(b"peter-parker", FindKind::Any).unwrap().unwrap();
    tx_b.update_current_value(&cursor_b, b"xyz".to_vec()).unwrap();

    tx_a.commit().unwrap();
    let err = tx_b.commit().unwrap_err();
    assert!(matches!(err, SopError::Conflict(_)), "expected Conflict, got {err:?}");

    let mut tx = store.begin(TransactionMode::ForReading).unwrap();
    let cursor = tx.find(b"peter-parker", FindKind::Any).unwrap().unwrap();
    assert_eq!(tx.get_current_value(&cursor).unwrap(), b"789");
}

#[test]
fn read_write_conflict_is_detected_at_commit() {
    let mut store = Store::new_btree("s4", StoreOptions::default(), backends()).unwrap();

    let mut seed = store.begin(TransactionMode::ForWriting).unwrap();
    seed.add(b"k".to_vec(), b"v0".to_vec()).unwrap();
    seed.commit().unwrap();

    let mut tx_r = store.begin(TransactionMode::ForWriting).unwrap();
    tx_r.find(b"k", FindKind::Any).unwrap().unwrap();

    let mut tx_w = store.begin(TransactionMode::ForWriting).unwrap();
    let cursor_w = tx_w.find(b"k", FindKind::Any).unwrap().unwrap();
    tx_w.update_current_value(&cursor_w, b"v1".to_vec()).unwrap();
    tx_w.commit().unwrap();

    let err = tx_r.commit().unwrap_err();
    assert!(matches!(err, SopError::Conflict(_)), "expected Conflict, got {err:?}");
}

#[test]
fn crash_mid_commit_is_compensated_by_the_sweeper() {
    let b = backends();
    let mut store = Store::new_btree("s_crash", StoreOptions::default(), b.clone()).unwrap();

    let mut seed = store.begin(TransactionMode::ForWriting).unwrap();
    seed.add(b"pre-existing".to_vec(), b"untouched".to_vec())
        .unwrap();
    seed.commit().unwrap();

    let mut tx_x = store.begin(TransactionMode::ForWriting).unwrap();
    tx_x.add(b"from-tx-x".to_vec(), b"wip".to_vec()).unwrap();
    tx_x.phase1_commit().unwrap();
    // The process dies here: phase2 never runs and tx_x is simply dropped,
    // leaving its log and staged (inactive-slot) blobs behind.
    drop(tx_x);

    let sweeper = recovery_sweeper(&b, Duration::from_secs(0));
    let report = sweeper.sweep().unwrap();
    assert_eq!(report.compensated.len(), 1);

    let mut tx = store.begin(TransactionMode::ForReading).unwrap();
    assert!(tx.find(b"from-tx-x", FindKind::Any).unwrap().is_none());
    let cursor = tx.find(b"pre-existing", FindKind::Any).unwrap().unwrap();
    assert_eq!(tx.get_current_value(&cursor).unwrap(), b"untouched");

    // A second sweep over the same (now-clean) log is a no-op.
    let report = sweeper.sweep().unwrap();
    assert!(report.compensated.is_empty());
}

#[test]
fn non_unique_store_preserves_insertion_order() {
    let options = StoreOptions {
        is_unique: false,
        ..StoreOptions::default()
    };
    let mut store = Store::new_btree("s5", options, backends()).unwrap();

    let mut tx = store.begin(TransactionMode::ForWriting).unwrap();
    tx.add(b"a".to_vec(), b"v1".to_vec()).unwrap();
    tx.add(b"a".to_vec(), b"v2".to_vec()).unwrap();
    tx.add(b"a".to_vec(), b"v3".to_vec()).unwrap();
    tx.commit().unwrap();

    let mut tx = store.begin(TransactionMode::ForReading).unwrap();
    let mut values = Vec::new();
    let mut cursor = tx.find(b"a", FindKind::First).unwrap().unwrap();
    values.push(tx.get_current_value(&cursor).unwrap());
    while let Some(next) = tx.next(&cursor).unwrap() {
        if tx.get_current_key(&next).unwrap() != b"a" {
            break;
        }
        values.push(tx.get_current_value(&next).unwrap());
        cursor = next;
    }
    assert_eq!(values, vec![b"v1".to_vec(), b"v2".to_vec(), b"v3".to_vec()]);
}
