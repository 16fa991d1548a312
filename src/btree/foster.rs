//! Foster-chain structure modifications. Every operation here is a
//! single-log system transaction (SSX): one multi-page record, no UNDO,
//! committed the moment it is appended.
//!
//! Forward execution applies each record through the same `redo` code
//! that recovery uses, so a replayed log can never diverge from the
//! original execution.

use log::debug;

use crate::{
    btree::{
        page::{below_fence, RecEntry},
        tree::BTree,
    },
    buffer::{LatchMode, PageGuard},
    error::DbError,
    types::DbResult,
    vol::{get_page_size, PageId},
    wal::{
        log_multi_update, log_page_update,
        record::{AdoptBody, DeadoptBody, MergeBody, NorecAllocBody, RebalanceBody, SplitBody},
        LogRecord,
    },
};

/// Allocate a page under WAL: the allocation record is appended before
/// the claim is visible anywhere else.
fn alloc_page_logged(tree: &BTree<'_>) -> Result<PageId, DbError> {
    let mut alloc = tree.alloc.lock().unwrap();
    let page_no = alloc.alloc_page()?;
    let pid = PageId::new(tree.root.vid, page_no);
    let mut rec = LogRecord::alloc_page(pid);
    tree.wal.append(&mut rec)?;
    Ok(pid)
}

fn dealloc_page_logged(tree: &BTree<'_>, pid: PageId) -> DbResult {
    let mut alloc = tree.alloc.lock().unwrap();
    let mut rec = LogRecord::dealloc_page(pid);
    tree.wal.append(&mut rec)?;
    alloc.dealloc_page(pid.page_no);
    Ok(())
}

// ----------------------------------------------------------------------
// split
// ----------------------------------------------------------------------

/// Foster split: carve the upper part of `src` into a fresh foster
/// child, without touching the real parent. `hint_key` steers the
/// boundary: a key beyond every existing record produces an empty
/// right page (append workloads).
pub fn sx_split(tree: &BTree<'_>, src: &mut PageGuard<'_>, hint_key: &[u8]) -> DbResult {
    assert_eq!(src.mode(), LatchMode::X);
    let count = src.page().user_slot_count();
    assert!(count > 0, "splitting an empty page");

    let new_pid = alloc_page_logged(tree)?;
    let mut child = tree.pool.fix_virgin(new_pid)?;

    // SSX 1: allocate and wire the empty foster child. The new page
    // takes over the source's old foster pointer; its key range is
    // empty until the split record below.
    let norec_body = NorecAllocBody {
        btree_root: src.page().btree_root(),
        level: src.page().level(),
        foster: src.page().foster_child().map(|p| p.to_u64()).unwrap_or(0),
        foster_emlsn: src.page().foster_emlsn().to_u64(),
        fence_low: src.page().high_fence().to_vec(),
        fence_high: src.page().high_fence().to_vec(),
        chain_high: src.page().chain_high_fence().to_vec(),
    };
    let mut rec = LogRecord::btree_norec_alloc(new_pid, src.page(), &norec_body);
    log_multi_update(tree.wal, &mut rec, child.page_mut(), src.page_mut())?;
    rec.redo(new_pid, child.page_mut());
    rec.redo(src.pid(), src.page_mut());

    // pick the boundary
    let last_key = src.page().user_key(count - 1);
    let (move_count, boundary) = if hint_key > last_key.as_slice()
        && below_fence(hint_key, src.page().high_fence())
    {
        (0usize, hint_key.to_vec())
    } else {
        let move_count = (count / 2).max(1);
        (move_count, src.page().user_key(count - move_count))
    };

    let mut moved = src.page().extract_records(count - move_count, count);
    if !src.page().is_leaf() {
        let n = tree.pool.unswizzle_records(&mut moved);
        src.sub_swizzled_ptr_cnt(n);
    }

    // build the new page's real content in place (fences, records, the
    // inherited foster pointer); the split record carries its image
    {
        let high = src.page().high_fence().to_vec();
        let chain = src.page().chain_high_fence().to_vec();
        child.page_mut().rebuild(&boundary, &high, &chain, &moved);
    }

    // SSX 2: the split itself
    let body = SplitBody {
        move_count: move_count as u16,
        new_high_fence: boundary.clone(),
        new_chain_high: src.page().chain_high_fence().to_vec(),
        page_image: child.page().bytes().to_vec(),
    };
    let mut rec = LogRecord::btree_split(new_pid, src.page(), &body);
    log_multi_update(tree.wal, &mut rec, child.page_mut(), src.page_mut())?;
    rec.redo(src.pid(), src.page_mut());

    src.mark_dirty();
    child.mark_dirty();
    // the source points at the new page: it must not reach disk first
    tree.pool.register_write_order_dependency(src.pid(), new_pid);
    debug!(
        "split {}: moved {} records to foster child {} at boundary {:?}",
        src.pid(),
        move_count,
        new_pid,
        boundary
    );
    Ok(())
}

// ----------------------------------------------------------------------
// grow (root carries a foster child -> add a level)
// ----------------------------------------------------------------------

/// The root cannot be adopted from above, so a root foster chain grows
/// the tree instead: the root's content moves into a fresh child and
/// the root becomes a one-entry branch above it. The root page id never
/// changes.
pub fn sx_grow(tree: &BTree<'_>, root: &mut PageGuard<'_>) -> DbResult {
    assert_eq!(root.mode(), LatchMode::X);
    if root.page().foster_child().is_none() {
        return Ok(());
    }

    let child_pid = alloc_page_logged(tree)?;
    let mut child = tree.pool.fix_virgin(child_pid)?;

    let mut records = root.page().extract_all_records();
    if !root.page().is_leaf() {
        tree.pool.unswizzle_records(&mut records);
    }
    root.clear_swizzled_ptr_cnt();

    {
        let rootp = root.page();
        let low = rootp.low_fence().to_vec();
        let high = rootp.high_fence().to_vec();
        let chain = rootp.chain_high_fence().to_vec();
        let store = rootp.store();
        let btree_root = rootp.btree_root();
        let level = rootp.level();
        let foster = rootp.foster_child();
        let foster_emlsn = rootp.foster_emlsn();

        let cp = child.page_mut();
        cp.btree_format(child_pid, store, btree_root, level, &low, &high, &chain, foster);
        cp.set_foster_emlsn(foster_emlsn);
        cp.rebuild(&low, &high, &chain, &records);
    }
    let mut rec = LogRecord::page_img_format(child.page());
    log_page_update(tree.wal, &mut rec, child.page_mut())?;

    {
        let low = root.page().low_fence().to_vec();
        // the root's own high fence narrowed at its last split; the new
        // branch level spans the whole chain again
        let chain = root.page().chain_high_fence().to_vec();
        let level = root.page().level();
        let entry = RecEntry {
            ghost: false,
            key: low.clone(),
            value: crate::vol::PageBuf::branch_value(child_pid, child.page().page_lsn()),
        };
        let rp = root.page_mut();
        rp.rebuild(&low, &chain, &chain, &[entry]);
        rp.set_level(level + 1);
        rp.set_foster_child_pid(None);
        rp.set_foster_emlsn(crate::wal::Lsn::NULL);
    }
    let mut rec = LogRecord::page_img_format(root.page());
    log_page_update(tree.wal, &mut rec, root.page_mut())?;

    root.mark_dirty();
    child.mark_dirty();
    tree.pool.register_write_order_dependency(root.pid(), child_pid);
    debug!(
        "grew tree {}: root {} now level {}, content in {}",
        tree.store,
        root.pid(),
        root.page().level(),
        child_pid
    );
    Ok(())
}

// ----------------------------------------------------------------------
// adoption / de-adoption
// ----------------------------------------------------------------------

/// Opportunistic adoption during descent: move `child`'s foster pointer
/// up into `parent` as a real child entry. Both guards may arrive in S;
/// conditional upgrades decide whether the adoption happens at all.
pub fn try_adopt(
    tree: &BTree<'_>,
    parent: &mut PageGuard<'_>,
    child: &mut PageGuard<'_>,
) -> DbResult {
    if child.page().foster_child().is_none() {
        return Ok(());
    }
    let parent_was_s = parent.mode() == LatchMode::S;
    if parent_was_s && !parent.try_upgrade() {
        return Ok(());
    }
    let child_was_s = child.mode() == LatchMode::S;
    if child_was_s && !child.try_upgrade() {
        if parent_was_s {
            parent.downgrade();
        }
        return Ok(());
    }

    let key = child.page().high_fence().to_vec();
    if parent.page().fits(&key, 16) && parent.page().search(&key).is_err() {
        sx_adopt(tree, parent, child)?;
    }

    if child_was_s {
        child.downgrade();
    }
    if parent_was_s {
        parent.downgrade();
    }
    Ok(())
}

/// The adoption SSX proper: both pages latched X.
pub fn sx_adopt(
    tree: &BTree<'_>,
    parent: &mut PageGuard<'_>,
    child: &mut PageGuard<'_>,
) -> DbResult {
    assert_eq!(parent.mode(), LatchMode::X);
    assert_eq!(child.mode(), LatchMode::X);
    let foster_pid = child
        .page()
        .foster_child()
        .expect("adopt without a foster child");

    let body = AdoptBody {
        child_pid: foster_pid,
        child_emlsn: child.page().foster_emlsn(),
        child_key: child.page().high_fence().to_vec(),
    };
    let mut rec = LogRecord::btree_foster_adopt(parent.page(), child.page(), &body);
    log_multi_update(tree.wal, &mut rec, parent.page_mut(), child.page_mut())?;
    rec.redo(parent.pid(), parent.page_mut());
    rec.redo(child.pid(), child.page_mut());
    parent.mark_dirty();
    child.mark_dirty();
    debug!(
        "adopted {} from foster parent {} into {}",
        foster_pid,
        child.pid(),
        parent.pid()
    );
    Ok(())
}

/// Inverse of adoption: push the real child at `slot` back into the
/// foster chain of its left sibling (the child at `slot - 1`).
pub fn sx_deadopt(tree: &BTree<'_>, parent: &mut PageGuard<'_>, slot: usize) -> DbResult {
    assert_eq!(parent.mode(), LatchMode::X);
    assert!(slot >= 1, "deadopt needs a left sibling under the same parent");

    let ptr = parent.page().child_ptr_at(slot);
    let fc_pid = tree.pool.resolve(ptr);
    let fc_emlsn = parent.page().emlsn_at(slot);
    let child_key = parent.page().user_key(slot);

    // the departing child's chain bound; its chain cannot change while
    // we hold the parent exclusively
    let new_chain_high = {
        let fc = tree.pool.fix_child(parent, slot, LatchMode::S, true)?;
        fc.page().chain_high_fence().to_vec()
    };

    let mut left = tree.pool.fix_child(parent, slot - 1, LatchMode::X, true)?;
    if left.page().foster_child().is_some() {
        return Err(DbError::conflict(
            "left sibling already carries a foster chain",
        ));
    }
    assert_eq!(
        left.page().high_fence(),
        child_key.as_slice(),
        "deadopt target is not adjacent"
    );

    // the entry leaves the parent; settle swizzle state first (the
    // sibling fixes above may have swizzled slots, so re-read)
    let ptr = parent.page().child_ptr_at(slot);
    if crate::vol::page_id::ptr_is_swizzled(ptr as u32) {
        let real = tree.pool.note_unswizzle(ptr);
        parent.page_mut().set_child_ptr_at(slot, real.to_u64());
        parent.sub_swizzled_ptr_cnt(1);
    }

    let body = DeadoptBody {
        child_pid: fc_pid,
        child_emlsn: fc_emlsn,
        child_key,
        new_chain_high,
    };
    let mut rec = LogRecord::btree_foster_deadopt(left.page(), parent.page(), &body);
    log_multi_update(tree.wal, &mut rec, left.page_mut(), parent.page_mut())?;
    rec.redo(left.pid(), left.page_mut());
    rec.redo(parent.pid(), parent.page_mut());
    parent.mark_dirty();
    left.mark_dirty();
    debug!("deadopted {} under {}", fc_pid, left.pid());
    Ok(())
}

// ----------------------------------------------------------------------
// merge / rebalance
// ----------------------------------------------------------------------

/// Fold the foster child's records into `src` and delete it. The caller
/// has established that a merge is desirable; this checks feasibility.
pub fn try_merge(tree: &BTree<'_>, src: &mut PageGuard<'_>) -> DbResult {
    assert_eq!(src.mode(), LatchMode::X);
    if src.page().foster_child().is_none() {
        return Ok(());
    }
    let foster = match tree.pool.fix_foster(src, LatchMode::X, true) {
        Ok(guard) => guard,
        Err(_) => return Ok(()),
    };

    // feasibility: every record of the child must fit, plus fence slack
    let needed: usize = (0..foster.page().user_slot_count())
        .map(|i| 6 + foster.page().user_key(i).len() + foster.page().user_value(i).len())
        .sum::<usize>()
        + 128;
    if src.page().contiguous_free() + src.page().reclaimable() < needed {
        return Ok(());
    }
    sx_merge(tree, src, foster)
}

pub fn sx_merge(
    tree: &BTree<'_>,
    src: &mut PageGuard<'_>,
    mut foster: PageGuard<'_>,
) -> DbResult {
    assert_eq!(src.mode(), LatchMode::X);
    assert_eq!(foster.mode(), LatchMode::X);
    let foster_pid = foster.pid();

    let mut records = foster.page().extract_all_records();
    if !foster.page().is_leaf() {
        let n = tree.pool.unswizzle_records(&mut records);
        foster.sub_swizzled_ptr_cnt(n);
    }

    let body = MergeBody {
        new_high: foster.page().high_fence().to_vec(),
        new_chain_high: foster.page().chain_high_fence().to_vec(),
        new_foster: foster.page().foster_child().map(|p| p.to_u64()).unwrap_or(0),
        new_foster_emlsn: foster.page().foster_emlsn().to_u64(),
        records,
    };
    let mut rec = LogRecord::btree_foster_merge(src.page(), foster.page(), &body);
    log_multi_update(tree.wal, &mut rec, src.page_mut(), foster.page_mut())?;
    rec.redo(src.pid(), src.page_mut());
    rec.redo(foster_pid, foster.page_mut());

    src.mark_dirty();
    foster.mark_dirty();
    // the dead source must never overwrite the surviving page's order
    tree.pool.register_write_order_dependency(foster_pid, src.pid());

    dealloc_page_logged(tree, foster_pid)?;
    drop(foster);
    tree.pool.kick_cleaner();
    debug!("merged foster child {} into {}", foster_pid, src.pid());
    Ok(())
}

/// Redistribute records between a foster parent and its foster child.
/// `move_count` records move right; the batch is chunked down if the
/// record would blow the log record cap.
pub fn sx_rebalance(
    tree: &BTree<'_>,
    src: &mut PageGuard<'_>,
    dest: &mut PageGuard<'_>,
    mut move_count: usize,
) -> DbResult {
    assert_eq!(src.mode(), LatchMode::X);
    assert_eq!(dest.mode(), LatchMode::X);
    assert_eq!(src.page().foster_child(), Some(dest.pid()));

    let count = src.page().user_slot_count();
    assert!(move_count <= count);
    let cap = 3 * get_page_size() - 512;

    loop {
        if move_count == 0 {
            return Ok(());
        }
        let boundary = src.page().user_key(count - move_count);
        let mut moved = src.page().extract_records(count - move_count, count);
        if !src.page().is_leaf() {
            let n = tree.pool.unswizzle_records(&mut moved);
            src.sub_swizzled_ptr_cnt(n);
        }
        let mut all = moved;
        all.extend(dest.page().extract_all_records());

        let body = RebalanceBody {
            move_count: move_count as u16,
            boundary,
            dest_high: dest.page().high_fence().to_vec(),
            chain_high: dest.page().chain_high_fence().to_vec(),
            records: all,
        };
        let mut rec = LogRecord::btree_foster_rebalance(dest.page(), src.page(), &body);
        if rec.encoded_len() > cap {
            move_count /= 2;
            continue;
        }
        log_multi_update(tree.wal, &mut rec, dest.page_mut(), src.page_mut())?;
        rec.redo(dest.pid(), dest.page_mut());
        rec.redo(src.pid(), src.page_mut());
        src.mark_dirty();
        dest.mark_dirty();
        tree.pool.register_write_order_dependency(src.pid(), dest.pid());
        debug!(
            "rebalanced {} records from {} into {}",
            move_count,
            src.pid(),
            dest.pid()
        );
        return Ok(());
    }
}

/// Fence-only rebalance: the source holds no real records, so only the
/// boundary key moves.
pub fn sx_rebalance_norec(
    tree: &BTree<'_>,
    src: &mut PageGuard<'_>,
    dest: &mut PageGuard<'_>,
    new_fence: &[u8],
) -> DbResult {
    assert_eq!(src.mode(), LatchMode::X);
    assert_eq!(dest.mode(), LatchMode::X);
    assert_eq!(
        src.page().user_slot_count(),
        0,
        "norec rebalance on a non-empty source"
    );
    let mut rec = LogRecord::btree_foster_rebalance_norec(dest.page(), src.page(), new_fence);
    log_multi_update(tree.wal, &mut rec, dest.page_mut(), src.page_mut())?;
    rec.redo(dest.pid(), dest.page_mut());
    rec.redo(src.pid(), src.page_mut());
    src.mark_dirty();
    dest.mark_dirty();
    Ok(())
}

// ----------------------------------------------------------------------
// single-page system transactions
// ----------------------------------------------------------------------

/// Compact the page's record region.
pub fn sx_defrag_page(tree: &BTree<'_>, guard: &mut PageGuard<'_>) -> DbResult {
    assert_eq!(guard.mode(), LatchMode::X);
    let mut rec = LogRecord::btree_ghost_reclaim(guard.page(), vec![]);
    log_page_update(tree.wal, &mut rec, guard.page_mut())?;
    guard.page_mut().defrag();
    guard.mark_dirty();
    Ok(())
}

/// Physically remove committed ghosts.
pub fn sx_reclaim_ghosts(
    tree: &BTree<'_>,
    guard: &mut PageGuard<'_>,
    keys: Vec<Vec<u8>>,
) -> DbResult {
    assert_eq!(guard.mode(), LatchMode::X);
    let mut rec = LogRecord::btree_ghost_reclaim(guard.page(), keys.clone());
    log_page_update(tree.wal, &mut rec, guard.page_mut())?;
    guard.page_mut().reclaim_ghosts(&keys);
    guard.mark_dirty();
    Ok(())
}

/// Reserve a ghost slot for an upcoming insert.
pub fn sx_reserve_ghost(
    tree: &BTree<'_>,
    guard: &mut PageGuard<'_>,
    key: &[u8],
    payload_len: usize,
) -> DbResult {
    assert_eq!(guard.mode(), LatchMode::X);
    let mut rec = LogRecord::btree_ghost_reserve(guard.page(), key, payload_len);
    log_page_update(tree.wal, &mut rec, guard.page_mut())?;
    guard.page_mut().reserve_ghost(key, payload_len)?;
    guard.mark_dirty();
    Ok(())
}

/// Rewrite the fence records (and with them the shared key prefix).
pub fn sx_compress_page(
    tree: &BTree<'_>,
    guard: &mut PageGuard<'_>,
    low: &[u8],
    high: &[u8],
    chain_high: &[u8],
) -> DbResult {
    assert_eq!(guard.mode(), LatchMode::X);
    let mut rec = LogRecord::btree_compress_page(guard.page(), low, high, chain_high);
    log_page_update(tree.wal, &mut rec, guard.page_mut())?;
    guard.page_mut().compress(low, high, chain_high);
    guard.mark_dirty();
    Ok(())
}
