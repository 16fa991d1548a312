mod common;

use common::{key, setup, test_dir, value};
use foster_db::{Engine, Options};

/// A pool far smaller than the working set, with swizzling on: every
/// insert batch must keep the swizzled pointers consistent, and after
/// checkpoint + force_all no frame is dirty and the on-disk tree is
/// sound (no swizzled pointer escaped to disk).
#[test]
fn test_eviction_and_swizzle_cycle() {
    setup();
    let dir = test_dir("swizzle-cycle");
    let mut options = Options::new(16);
    options.swizzling = true;
    let engine = Engine::open(&dir, options).unwrap();

    let tx = engine.begin();
    let store = tx.create_index().unwrap();
    tx.commit().unwrap();

    let total = 3000;
    for chunk in 0..(total / 100) {
        let tx = engine.begin();
        let index = tx.open_index(store).unwrap();
        for i in chunk * 100..(chunk + 1) * 100 {
            index.insert(&tx, &key(i), &value(i, 100)).unwrap();
        }
        tx.commit().unwrap();
        // invariant 3: swizzled pointers resolve to resident frames
        engine.verify_swizzled_pointers();
    }

    assert!(
        engine.buffer_resident_count() <= 16,
        "resident pages exceed the frame count"
    );

    engine.checkpoint().unwrap();
    engine.force_all().unwrap();
    assert_eq!(engine.buffer_dirty_count(), 0, "force_all left dirt behind");
    engine.verify_swizzled_pointers();
    engine.shutdown().unwrap();

    // a fresh engine reads the tree purely from disk: any swizzled
    // pointer that leaked into a page image would break the walk
    let engine = Engine::open(&dir, Options::new(64)).unwrap();
    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    index.verify().unwrap();
    for i in (0..total).step_by(101) {
        assert_eq!(index.get(&tx, &key(i)).unwrap(), Some(value(i, 100)));
    }
    let mut cursor = index.range(&tx, b"", b"").unwrap();
    let count = cursor.by_ref().count();
    assert!(cursor.take_error().is_none());
    assert_eq!(count, total);
    drop(cursor);
    tx.commit().unwrap();
    engine.shutdown().unwrap();
}

/// Without swizzling, a tiny pool still makes progress through
/// eviction pressure.
#[test]
fn test_small_pool_progress() {
    setup();
    let dir = test_dir("small-pool");
    let engine = Engine::open(&dir, Options::new(8)).unwrap();

    let tx = engine.begin();
    let store = tx.create_index().unwrap();
    let index = tx.open_index(store).unwrap();
    for i in 0..800 {
        index.insert(&tx, &key(i), &value(i, 100)).unwrap();
    }
    tx.commit().unwrap();

    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    for i in (0..800).step_by(61) {
        assert_eq!(index.get(&tx, &key(i)).unwrap(), Some(value(i, 100)));
    }
    tx.commit().unwrap();
    engine.shutdown().unwrap();
}

/// The random replacement policy is functional, if unfashionable.
#[test]
fn test_random_policy() {
    setup();
    let dir = test_dir("random-policy");
    let mut options = Options::new(16);
    options.set("sm_replacement_policy", "random").unwrap();
    let engine = Engine::open(&dir, options).unwrap();

    let tx = engine.begin();
    let store = tx.create_index().unwrap();
    let index = tx.open_index(store).unwrap();
    for i in 0..500 {
        index.insert(&tx, &key(i), &value(i, 100)).unwrap();
    }
    tx.commit().unwrap();

    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    for i in (0..500).step_by(43) {
        assert_eq!(index.get(&tx, &key(i)).unwrap(), Some(value(i, 100)));
    }
    tx.commit().unwrap();
    engine.shutdown().unwrap();
}
