mod common;

use common::{crash_options, key, setup, test_dir, value};
use foster_db::{
    wal::{RecordKind, FIRST_LSN},
    Engine, Options,
};

/// Committed data survives a crash (REDO).
#[test]
fn test_committed_data_survives_crash() {
    setup();
    let dir = test_dir("redo");
    let store;
    {
        let engine = Engine::open(&dir, crash_options(64)).unwrap();
        let tx = engine.begin();
        store = tx.create_index().unwrap();
        let index = tx.open_index(store).unwrap();
        for i in 0..100 {
            index.insert(&tx, &key(i), &value(i, 32)).unwrap();
        }
        tx.commit().unwrap();
        // crash: drop without shutdown; nothing was forced to the
        // volume, so REDO must reconstruct the pages
        drop(engine);
    }

    let engine = Engine::open(&dir, crash_options(64)).unwrap();
    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    for i in 0..100 {
        assert_eq!(
            index.get(&tx, &key(i)).unwrap(),
            Some(value(i, 32)),
            "key {} lost across the crash",
            i
        );
    }
    tx.commit().unwrap();
    engine.shutdown().unwrap();
}

/// Crash between insert and commit: after restart the key is gone and
/// the log carries the rollback (UNDO) record plus its compensation.
#[test]
fn test_crash_between_insert_and_commit() {
    setup();
    let dir = test_dir("undo");
    let store;
    {
        let engine = Engine::open(&dir, crash_options(64)).unwrap();
        let tx = engine.begin();
        store = tx.create_index().unwrap();
        tx.commit().unwrap();

        let tx = engine.begin();
        let index = tx.open_index(store).unwrap();
        index.insert(&tx, b"a", b"1").unwrap();
        // the insert must be durable for the crash to be interesting
        engine.wal().flush_all().unwrap();
        // crash with the transaction in flight
        std::mem::forget(tx);
        drop(engine);
    }

    let engine = Engine::open(&dir, crash_options(64)).unwrap();
    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    assert_eq!(index.get(&tx, b"a").unwrap(), None);
    // readers see no ghost either
    let mut cursor = index.range(&tx, b"", b"").unwrap();
    assert_eq!(cursor.by_ref().count(), 0);
    assert!(cursor.take_error().is_none());
    drop(cursor);
    tx.commit().unwrap();

    // log evidence: a rollback-flagged undo of the insert and a
    // compensation record
    let mut saw_rollback_mark = false;
    let mut saw_compensation = false;
    for (_, rec) in engine.wal().scan_from(FIRST_LSN) {
        if rec.kind == RecordKind::BtreeGhostMark && rec.is_rollback() {
            saw_rollback_mark = true;
        }
        if rec.kind == RecordKind::Compensate {
            saw_compensation = true;
        }
    }
    assert!(saw_rollback_mark, "missing the logical UNDO record");
    assert!(saw_compensation, "missing the compensation record");

    engine.shutdown().unwrap();
}

/// The committed prefix survives, the uncommitted suffix does not.
#[test]
fn test_mixed_commit_and_loser() {
    setup();
    let dir = test_dir("mixed");
    let store;
    {
        let engine = Engine::open(&dir, crash_options(64)).unwrap();
        let tx = engine.begin();
        store = tx.create_index().unwrap();
        let index = tx.open_index(store).unwrap();
        for i in 0..50 {
            index.insert(&tx, &key(i), &value(i, 24)).unwrap();
        }
        tx.commit().unwrap();

        let loser = engine.begin();
        let index = loser.open_index(store).unwrap();
        for i in 50..80 {
            index.insert(&loser, &key(i), &value(i, 24)).unwrap();
        }
        index.remove(&loser, &key(3)).unwrap();
        index.update(&loser, &key(4), b"clobbered").unwrap();
        engine.wal().flush_all().unwrap();
        std::mem::forget(loser);
        drop(engine);
    }

    let engine = Engine::open(&dir, crash_options(64)).unwrap();
    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    for i in 0..50 {
        assert_eq!(index.get(&tx, &key(i)).unwrap(), Some(value(i, 24)));
    }
    for i in 50..80 {
        assert_eq!(index.get(&tx, &key(i)).unwrap(), None);
    }
    tx.commit().unwrap();
    index.verify().unwrap();
    engine.shutdown().unwrap();
}

/// Restart after a clean shutdown finds nothing to do and data intact.
#[test]
fn test_clean_shutdown_reopen() {
    setup();
    let dir = test_dir("clean");
    let store;
    {
        let engine = Engine::open(&dir, Options::new(64)).unwrap();
        let tx = engine.begin();
        store = tx.create_index().unwrap();
        let index = tx.open_index(store).unwrap();
        for i in 0..200 {
            index.insert(&tx, &key(i), &value(i, 48)).unwrap();
        }
        tx.commit().unwrap();
        engine.shutdown().unwrap();
    }

    let engine = Engine::open(&dir, Options::new(64)).unwrap();
    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    for i in (0..200).step_by(17) {
        assert_eq!(index.get(&tx, &key(i)).unwrap(), Some(value(i, 48)));
    }
    tx.commit().unwrap();
    engine.shutdown().unwrap();
}

/// Page-driven REDO (single-page recovery per in-doubt page) arrives at
/// the same state as the log-driven scan.
#[test]
fn test_page_driven_redo() {
    setup();
    let dir = test_dir("page-redo");
    let store;
    {
        let engine = Engine::open(&dir, crash_options(64)).unwrap();
        let tx = engine.begin();
        store = tx.create_index().unwrap();
        let index = tx.open_index(store).unwrap();
        for i in 0..150 {
            index.insert(&tx, &key(i), &value(i, 40)).unwrap();
        }
        tx.commit().unwrap();
        drop(engine);
    }

    let mut options = crash_options(64);
    options.page_driven_redo = true;
    let engine = Engine::open(&dir, options).unwrap();
    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    for i in 0..150 {
        assert_eq!(index.get(&tx, &key(i)).unwrap(), Some(value(i, 40)));
    }
    tx.commit().unwrap();
    index.verify().unwrap();
    engine.shutdown().unwrap();
}

/// Replaying a ghost-reclaim record twice leaves the page exactly as
/// after the first replay (REDO idempotence), observed end-to-end by
/// crashing after the reclaim and recovering twice.
#[test]
fn test_ghost_reclaim_replay_idempotent() {
    setup();
    let dir = test_dir("reclaim-idem");
    let store;
    {
        let engine = Engine::open(&dir, crash_options(64)).unwrap();
        let tx = engine.begin();
        store = tx.create_index().unwrap();
        let index = tx.open_index(store).unwrap();
        for i in 0..20 {
            index.insert(&tx, &key(i), &value(i, 16)).unwrap();
        }
        tx.commit().unwrap();

        // committed removals; the ghosts are reclaimable afterwards
        let tx = engine.begin();
        let index = tx.open_index(store).unwrap();
        for i in 0..10 {
            index.remove(&tx, &key(i)).unwrap();
        }
        tx.commit().unwrap();

        // trigger reclamation and crash without forcing pages
        let tx = engine.begin();
        let index = tx.open_index(store).unwrap();
        for i in 0..10 {
            index.insert(&tx, &key(i + 100), &value(i, 16)).unwrap();
        }
        tx.commit().unwrap();
        drop(engine);
    }

    // two consecutive recoveries replay the same reclaim records
    for _ in 0..2 {
        let engine = Engine::open(&dir, crash_options(64)).unwrap();
        let tx = engine.begin();
        let index = tx.open_index(store).unwrap();
        for i in 0..10 {
            assert_eq!(index.get(&tx, &key(i)).unwrap(), None);
            assert_eq!(index.get(&tx, &key(i + 10)).unwrap(), Some(value(i + 10, 16)));
        }
        tx.commit().unwrap();
        index.verify().unwrap();
        drop(engine);
    }
}
