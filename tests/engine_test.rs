mod common;

use common::{key, open_engine, setup, test_dir, value};
use foster_db::ErrorKind;

/// open; create an index in one transaction; insert in a second;
/// read the value back in a third.
#[test]
fn test_basic_round_trip() {
    setup();
    let dir = test_dir("round-trip");
    let engine = open_engine(&dir, 64);

    let tx = engine.begin();
    let store = tx.create_index().unwrap();
    tx.commit().unwrap();

    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    index.insert(&tx, b"k00001", b"v").unwrap();
    tx.commit().unwrap();

    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    assert_eq!(index.get(&tx, b"k00001").unwrap(), Some(b"v".to_vec()));
    tx.commit().unwrap();

    engine.log_comment("round trip done").unwrap();
    engine.force_volume(engine.vid()).unwrap();
    assert_eq!(engine.buffer_dirty_count(), 0);
    engine.shutdown().unwrap();
}

#[test]
fn test_insert_abort_leaves_nothing() {
    setup();
    let dir = test_dir("abort");
    let engine = open_engine(&dir, 64);

    let tx = engine.begin();
    let store = tx.create_index().unwrap();
    tx.commit().unwrap();

    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    index.insert(&tx, &key(1), &value(1, 16)).unwrap();
    assert!(index.get(&tx, &key(1)).unwrap().is_some());
    tx.abort().unwrap();

    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    assert_eq!(index.get(&tx, &key(1)).unwrap(), None);
    tx.commit().unwrap();

    engine.shutdown().unwrap();
}

#[test]
fn test_update_then_read() {
    setup();
    let dir = test_dir("update");
    let engine = open_engine(&dir, 64);

    let tx = engine.begin();
    let store = tx.create_index().unwrap();
    let index = tx.open_index(store).unwrap();
    index.insert(&tx, &key(7), b"original").unwrap();
    index.update(&tx, &key(7), b"updated!").unwrap();
    tx.commit().unwrap();

    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    assert_eq!(index.get(&tx, &key(7)).unwrap(), Some(b"updated!".to_vec()));
    tx.commit().unwrap();

    engine.shutdown().unwrap();
}

#[test]
fn test_overwrite_slice() {
    setup();
    let dir = test_dir("overwrite");
    let engine = open_engine(&dir, 64);

    let tx = engine.begin();
    let store = tx.create_index().unwrap();
    let index = tx.open_index(store).unwrap();
    index.insert(&tx, &key(1), b"0123456789").unwrap();
    index.overwrite(&tx, &key(1), 4, b"ZZ").unwrap();
    tx.commit().unwrap();

    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    assert_eq!(
        index.get(&tx, &key(1)).unwrap(),
        Some(b"0123ZZ6789".to_vec())
    );
    tx.commit().unwrap();

    engine.shutdown().unwrap();
}

#[test]
fn test_insert_remove_commit() {
    setup();
    let dir = test_dir("remove");
    let engine = open_engine(&dir, 64);

    let tx = engine.begin();
    let store = tx.create_index().unwrap();
    let index = tx.open_index(store).unwrap();
    index.insert(&tx, &key(1), &value(1, 8)).unwrap();
    index.remove(&tx, &key(1)).unwrap();
    tx.commit().unwrap();

    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    assert_eq!(index.get(&tx, &key(1)).unwrap(), None);
    // removing a missing key is a logical no-op
    index.remove(&tx, &key(1)).unwrap();
    tx.commit().unwrap();

    engine.shutdown().unwrap();
}

#[test]
fn test_duplicate_insert_rejected_without_damage() {
    setup();
    let dir = test_dir("duplicate");
    let engine = open_engine(&dir, 64);

    let tx = engine.begin();
    let store = tx.create_index().unwrap();
    let index = tx.open_index(store).unwrap();
    index.insert(&tx, &key(1), b"first").unwrap();
    let err = index.insert(&tx, &key(1), b"second").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DuplicateKey);
    // the original value is untouched
    assert_eq!(index.get(&tx, &key(1)).unwrap(), Some(b"first".to_vec()));
    tx.commit().unwrap();

    engine.shutdown().unwrap();
}

#[test]
fn test_update_missing_key_errors() {
    setup();
    let dir = test_dir("update-missing");
    let engine = open_engine(&dir, 64);

    let tx = engine.begin();
    let store = tx.create_index().unwrap();
    let index = tx.open_index(store).unwrap();
    let err = index.update(&tx, &key(1), b"x").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    tx.commit().unwrap();

    engine.shutdown().unwrap();
}

#[test]
fn test_range_scan_in_order() {
    setup();
    let dir = test_dir("range");
    let engine = open_engine(&dir, 64);

    let tx = engine.begin();
    let store = tx.create_index().unwrap();
    let index = tx.open_index(store).unwrap();
    for i in (0..50).rev() {
        index.insert(&tx, &key(i), &value(i, 12)).unwrap();
    }
    // a removed key must not show up
    index.remove(&tx, &key(25)).unwrap();
    tx.commit().unwrap();

    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    let mut cursor = index.range(&tx, &key(10), &key(40)).unwrap();
    let got: Vec<Vec<u8>> = cursor.by_ref().map(|(k, _)| k).collect();
    assert!(cursor.take_error().is_none());

    let expected: Vec<Vec<u8>> = (10..40).filter(|&i| i != 25).map(key).collect();
    assert_eq!(got, expected);
    drop(cursor);
    tx.commit().unwrap();

    engine.shutdown().unwrap();
}

#[test]
fn test_two_indexes_are_independent() {
    setup();
    let dir = test_dir("two-stores");
    let engine = open_engine(&dir, 64);

    let tx = engine.begin();
    let store_a = tx.create_index().unwrap();
    let store_b = tx.create_index().unwrap();
    assert_ne!(store_a, store_b);
    let a = tx.open_index(store_a).unwrap();
    let b = tx.open_index(store_b).unwrap();
    a.insert(&tx, &key(1), b"in-a").unwrap();
    b.insert(&tx, &key(1), b"in-b").unwrap();
    tx.commit().unwrap();

    let tx = engine.begin();
    let a = tx.open_index(store_a).unwrap();
    let b = tx.open_index(store_b).unwrap();
    assert_eq!(a.get(&tx, &key(1)).unwrap(), Some(b"in-a".to_vec()));
    assert_eq!(b.get(&tx, &key(1)).unwrap(), Some(b"in-b".to_vec()));
    tx.commit().unwrap();

    engine.shutdown().unwrap();
}

#[test]
fn test_lock_conflict_times_out() {
    setup();
    let dir = test_dir("lock-conflict");
    let mut options = foster_db::Options::new(64);
    options.lock_timeout_ms = 100;
    let engine = foster_db::Engine::open(&dir, options).unwrap();

    let tx1 = engine.begin();
    let store = tx1.create_index().unwrap();
    let index = tx1.open_index(store).unwrap();
    index.insert(&tx1, &key(1), b"held").unwrap();

    // tx2 cannot write the same key while tx1 holds its lock
    let tx2 = engine.begin();
    let index2 = tx2.open_index(store).unwrap();
    let err = index2.insert(&tx2, &key(1), b"contender").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    tx2.abort().unwrap();

    tx1.commit().unwrap();
    engine.shutdown().unwrap();
}
