mod common;

use std::{
    fs::OpenOptions,
    io::{Seek, SeekFrom, Write},
};

use common::{key, setup, test_dir, value};
use foster_db::{Engine, Options};

/// Scribble over a page's body inside the volume file.
fn corrupt_page(dir: &std::path::PathBuf, page_no: u32) {
    let page_size = foster_db::vol::get_page_size() as u64;
    let mut file = OpenOptions::new()
        .write(true)
        .open(dir.join("volume.db"))
        .unwrap();
    file.seek(SeekFrom::Start(page_no as u64 * page_size + 300))
        .unwrap();
    file.write_all(&[0xde; 512]).unwrap();
    file.sync_all().unwrap();
}

/// Corrupt the single-leaf root on disk; the next read detects the
/// checksum mismatch and single-page recovery rebuilds the page from
/// its log chain.
#[test]
fn test_spr_root_leaf() {
    setup();
    let dir = test_dir("spr-root");
    let store;
    let root;
    {
        let engine = Engine::open(&dir, Options::new(64)).unwrap();
        let tx = engine.begin();
        store = tx.create_index().unwrap();
        let index = tx.open_index(store).unwrap();
        for i in 0..40 {
            index.insert(&tx, &key(i), &value(i, 32)).unwrap();
        }
        tx.commit().unwrap();
        root = engine.store_root(store).unwrap();
        engine.shutdown().unwrap();
    }

    corrupt_page(&dir, root.page_no);

    let engine = Engine::open(&dir, Options::new(64)).unwrap();
    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    for i in 0..40 {
        assert_eq!(
            index.get(&tx, &key(i)).unwrap(),
            Some(value(i, 32)),
            "key {} lost to corruption",
            i
        );
    }
    tx.commit().unwrap();
    index.verify().unwrap();
    engine.shutdown().unwrap();
}

/// Corrupt a leaf of a multi-level tree: recovery is bounded by the
/// parent's EMLSN plus the log tail.
#[test]
fn test_spr_inner_leaf() {
    setup();
    let dir = test_dir("spr-leaf");
    let store;
    {
        let engine = Engine::open(&dir, Options::new(128)).unwrap();
        let tx = engine.begin();
        store = tx.create_index().unwrap();
        let index = tx.open_index(store).unwrap();
        for i in 0..800 {
            index.insert(&tx, &key(i), &value(i, 100)).unwrap();
        }
        tx.commit().unwrap();
        assert!(index.height().unwrap() >= 2);
        engine.shutdown().unwrap();
    }

    // pick a data page that is not the root and wreck it; data pages
    // follow the volume's header pages
    let victim = {
        let engine = Engine::open(&dir, Options::new(128)).unwrap();
        let root = engine.store_root(store).unwrap();
        engine.shutdown().unwrap();
        // the page allocated right after the root is a leaf of this tree
        root.page_no + 1
    };
    corrupt_page(&dir, victim);

    let engine = Engine::open(&dir, Options::new(128)).unwrap();
    let tx = engine.begin();
    let index = tx.open_index(store).unwrap();
    for i in 0..800 {
        assert_eq!(
            index.get(&tx, &key(i)).unwrap(),
            Some(value(i, 100)),
            "key {} lost to corruption",
            i
        );
    }
    tx.commit().unwrap();
    index.verify().unwrap();
    engine.shutdown().unwrap();
}
