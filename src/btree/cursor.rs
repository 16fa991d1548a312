//! Range scans. A cursor drains one leaf at a time into a small batch,
//! holding no latch between `next` calls; the leaf frame stays pinned
//! (`pin_for_refix`) so the common resume path skips the hash lookup.

use std::collections::VecDeque;

use crate::{
    btree::{page::below_fence, tree::BTree},
    buffer::{LatchMode, PageGuard},
    error::DbError,
    transaction::{lock_table::Permission, Xct},
};

pub struct Cursor<'a> {
    tree: BTree<'a>,
    tx: &'a Xct,
    /// Inclusive lower bound of the next batch; None = exhausted.
    next_key: Option<Vec<u8>>,
    /// Exclusive upper bound; empty = unbounded.
    high: Vec<u8>,
    batch: VecDeque<(Vec<u8>, Vec<u8>)>,
    /// Pinned frame of the last visited leaf, for refix.
    pinned: Option<usize>,
    error: Option<DbError>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(tree: BTree<'a>, tx: &'a Xct, low: &[u8], high: &[u8]) -> Self {
        Self {
            tree,
            tx,
            next_key: Some(low.to_vec()),
            high: high.to_vec(),
            batch: VecDeque::new(),
            pinned: None,
            error: None,
        }
    }

    /// The first error the scan ran into, if any; iteration stopped
    /// there.
    pub fn take_error(&mut self) -> Option<DbError> {
        self.error.take()
    }

    fn unpin(&mut self) {
        if let Some(idx) = self.pinned.take() {
            self.tree.pool.unpin_for_refix(idx);
        }
    }

    fn fill_batch(&mut self) -> Result<(), DbError> {
        let start = match self.next_key.take() {
            Some(k) => k,
            None => return Ok(()),
        };

        // resume on the pinned leaf when it still covers the position
        let leaf = match self.pinned {
            Some(idx) => {
                let guard = self.tree.pool.refix(idx, LatchMode::S, false)?;
                if guard.page().is_leaf() && guard.page().fence_contains(&start) {
                    guard
                } else {
                    drop(guard);
                    self.tree.traverse_for_scan(&start)?
                }
            }
            None => self.tree.traverse_for_scan(&start)?,
        };

        let mut past_bound = false;
        {
            let page = leaf.page();
            for i in 0..page.user_slot_count() {
                let key = page.user_key(i);
                if key < start {
                    continue;
                }
                if !self.high.is_empty() && key.as_slice() >= self.high.as_slice() {
                    past_bound = true;
                    break;
                }
                if page.is_ghost(i) {
                    continue;
                }
                self.tree
                    .locks
                    .acquire(
                        self.tx.tid(),
                        self.tree.store,
                        &key,
                        Permission::ReadOnly.to_lock(),
                    )?;
                self.batch.push_back((key, page.user_value(i).to_vec()));
            }
        }

        let leaf_high = leaf.page().high_fence().to_vec();
        let exhausted = past_bound
            || leaf_high.is_empty()
            || (!self.high.is_empty() && leaf_high.as_slice() >= self.high.as_slice());
        if exhausted {
            self.next_key = None;
            drop(leaf);
            self.unpin();
            return Ok(());
        }
        self.next_key = Some(leaf_high);

        // swap the pin over to this leaf for the next refix attempt
        let idx = self.tree.pool.pin_for_refix(&leaf);
        drop(leaf);
        self.unpin();
        self.pinned = Some(idx);
        Ok(())
    }
}

impl<'a> Iterator for Cursor<'a> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        while self.batch.is_empty() && self.next_key.is_some() && self.error.is_none() {
            if let Err(e) = self.fill_batch() {
                self.error = Some(e);
            }
        }
        self.batch.pop_front()
    }
}

impl<'a> Drop for Cursor<'a> {
    fn drop(&mut self) {
        self.unpin();
    }
}

impl<'a> BTree<'a> {
    /// S-mode descent for scans; identical edge-crossing rules to the
    /// point operations, without the write-side upgrades.
    pub(crate) fn traverse_for_scan(&self, key: &[u8]) -> Result<PageGuard<'a>, DbError> {
        let mut cur = self.pool.fix(self.root, LatchMode::S, false)?;
        loop {
            while cur.page().foster_child().is_some()
                && !below_fence(key, cur.page().high_fence())
            {
                let next = self.pool.fix_foster(&cur, LatchMode::S, false)?;
                cur = next;
            }
            if cur.page().is_leaf() {
                return Ok(cur);
            }
            let slot = cur.page().search_branch(key);
            let child = self.pool.fix_child(&mut cur, slot, LatchMode::S, false)?;
            cur = child;
        }
    }
}
