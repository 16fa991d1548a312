mod common;

use common::{key, open_engine, setup, test_dir, value};
use foster_db::wal::{RecordKind, FIRST_LSN};
use itertools::Itertools;

/// Insert a thousand keys with 100-byte values: the tree must grow past
/// one level, every split must pair one `btree_split` with one
/// `btree_norec_alloc`, and the invariant walker must pass.
#[test]
fn test_split_scenario() {
    setup();
    let dir = test_dir("split");
    let engine = open_engine(&dir, 256);

    let tx = engine.begin();
    let store = tx.create_index().unwrap();
    let index = tx.open_index(store).unwrap();
    for i in 0..1000 {
        index.insert(&tx, &key(i), &value(i, 100)).unwrap();
    }
    tx.commit().unwrap();

    assert!(index.height().unwrap() >= 2, "tree should have grown");
    let pages = index.verify().unwrap();
    assert!(pages > 2, "expected a multi-page tree, saw {} pages", pages);

    let mut splits = 0;
    let mut norec_allocs = 0;
    for (_, rec) in engine.wal().scan_from(FIRST_LSN) {
        match rec.kind {
            RecordKind::BtreeSplit => splits += 1,
            RecordKind::BtreeNorecAlloc => norec_allocs += 1,
            _ => {}
        }
    }
    assert!(splits >= 1);
    assert_eq!(
        splits, norec_allocs,
        "every split allocates exactly one foster child"
    );

    // every key still readable
    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    for i in (0..1000).step_by(37) {
        assert_eq!(
            index.get(&tx, &key(i)).unwrap(),
            Some(value(i, 100)),
            "key {} lost after splits",
            i
        );
    }
    tx.commit().unwrap();

    engine.shutdown().unwrap();
}

#[test]
fn test_full_scan_after_splits() {
    setup();
    let dir = test_dir("scan-split");
    let engine = open_engine(&dir, 256);

    let tx = engine.begin();
    let store = tx.create_index().unwrap();
    let index = tx.open_index(store).unwrap();
    // reverse order stresses the non-append split path
    for i in (0..600).rev() {
        index.insert(&tx, &key(i), &value(i, 100)).unwrap();
    }
    tx.commit().unwrap();

    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    let mut cursor = index.range(&tx, b"", b"").unwrap();
    let keys: Vec<Vec<u8>> = cursor.by_ref().map(|(k, _)| k).collect();
    assert!(cursor.take_error().is_none());
    assert_eq!(keys.len(), 600);
    assert!(keys.iter().tuple_windows().all(|(a, b)| a < b));
    assert_eq!(keys, (0..600).map(key).collect::<Vec<_>>());
    drop(cursor);
    tx.commit().unwrap();

    engine.shutdown().unwrap();
}

#[test]
fn test_large_values_across_pages() {
    setup();
    let dir = test_dir("large-values");
    let engine = open_engine(&dir, 128);

    let tx = engine.begin();
    let store = tx.create_index().unwrap();
    let index = tx.open_index(store).unwrap();
    // a handful of records per page
    for i in 0..64 {
        index.insert(&tx, &key(i), &value(i, 1500)).unwrap();
    }
    tx.commit().unwrap();

    index.verify().unwrap();

    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    for i in 0..64 {
        assert_eq!(index.get(&tx, &key(i)).unwrap(), Some(value(i, 1500)));
    }
    tx.commit().unwrap();

    engine.shutdown().unwrap();
}

#[test]
fn test_remove_many_then_reinsert() {
    setup();
    let dir = test_dir("churn");
    let engine = open_engine(&dir, 256);

    let tx = engine.begin();
    let store = tx.create_index().unwrap();
    let index = tx.open_index(store).unwrap();
    for i in 0..400 {
        index.insert(&tx, &key(i), &value(i, 64)).unwrap();
    }
    tx.commit().unwrap();

    // ghost-mark half of them, in a committed transaction so the
    // ghosts become reclaimable
    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    for i in (0..400).step_by(2) {
        index.remove(&tx, &key(i)).unwrap();
    }
    tx.commit().unwrap();

    // reinsert over the ghosts with different values
    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    for i in (0..400).step_by(2) {
        index.insert(&tx, &key(i), &value(i + 1000, 64)).unwrap();
    }
    tx.commit().unwrap();

    index.verify().unwrap();

    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    for i in 0..400 {
        let expect = if i % 2 == 0 {
            value(i + 1000, 64)
        } else {
            value(i, 64)
        };
        assert_eq!(index.get(&tx, &key(i)).unwrap(), Some(expect));
    }
    tx.commit().unwrap();

    engine.shutdown().unwrap();
}

#[test]
fn test_defrag_keeps_content() {
    setup();
    let dir = test_dir("defrag");
    let engine = open_engine(&dir, 128);

    let tx = engine.begin();
    let store = tx.create_index().unwrap();
    let index = tx.open_index(store).unwrap();
    for i in 0..200 {
        index.insert(&tx, &key(i), &value(i, 80)).unwrap();
    }
    tx.commit().unwrap();

    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    for i in (0..200).step_by(3) {
        index.remove(&tx, &key(i)).unwrap();
    }
    tx.commit().unwrap();

    index.defrag().unwrap();
    index.verify().unwrap();

    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    for i in 0..200 {
        let got = index.get(&tx, &key(i)).unwrap();
        if i % 3 == 0 {
            assert_eq!(got, None);
        } else {
            assert_eq!(got, Some(value(i, 80)));
        }
    }
    tx.commit().unwrap();

    engine.shutdown().unwrap();
}
