//! Background page cleaner: collects dirty frames in rec_lsn order,
//! enforces WAL (log flushed through the batch's highest page LSN),
//! translates swizzled pointers back to page ids in scratch copies, and
//! issues grouped writes honoring write-order dependencies.

use std::{
    sync::{atomic::Ordering, Arc},
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{bounded, Receiver, Sender};
use log::{debug, info};

use crate::{
    buffer::pool::BufferPool,
    error::DbError,
    vol::{
        page_id::{ptr_is_swizzled, ptr_to_frame},
        tag, PageBuf, PageId,
    },
    wal::Lsn,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CleanerMsg {
    Wake,
    Shutdown,
}

pub struct Cleaner {
    handles: Vec<JoinHandle<()>>,
    tx: Sender<CleanerMsg>,
}

impl Cleaner {
    pub fn spawn(pool: Arc<BufferPool>, threads: usize, interval_ms: u64) -> Cleaner {
        let (tx, rx) = bounded::<CleanerMsg>(16);
        pool.set_cleaner(tx.clone());
        let handles = (0..threads.max(1))
            .map(|i| {
                let pool = Arc::clone(&pool);
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("cleaner-{}", i))
                    .spawn(move || cleaner_loop(pool, rx, interval_ms))
                    .expect("spawn cleaner thread")
            })
            .collect();
        Cleaner { handles, tx }
    }

    pub fn shutdown(mut self) {
        for _ in 0..self.handles.len() {
            let _ = self.tx.send(CleanerMsg::Shutdown);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        info!("cleaner stopped");
    }
}

fn cleaner_loop(pool: Arc<BufferPool>, rx: Receiver<CleanerMsg>, interval_ms: u64) {
    loop {
        match rx.recv_timeout(Duration::from_millis(interval_ms)) {
            Ok(CleanerMsg::Shutdown) => break,
            Ok(CleanerMsg::Wake) | Err(_) => {}
        }
        if let Err(e) = pool.clean_pass() {
            e.show_backtrace();
        }
    }
}

struct WriteItem {
    idx: usize,
    pid: PageId,
    copy: PageBuf,
    copied_lsn: Lsn,
}

impl BufferPool {
    /// One cleaning sweep. Also the synchronous engine of `force_all`.
    pub fn clean_pass(&self) -> Result<usize, DbError> {
        // batch selection in rec_lsn order
        let mut candidates: Vec<(usize, Lsn)> = Vec::new();
        for (idx, frame) in self.frames.iter().enumerate() {
            if frame.cb.used.load(Ordering::Acquire) && frame.cb.dirty.load(Ordering::Acquire) {
                candidates.push((idx, frame.cb.rec_lsn()));
            }
        }
        candidates.sort_by_key(|(_, rec_lsn)| *rec_lsn);

        let mut batch: Vec<WriteItem> = Vec::new();
        for (idx, _) in candidates {
            if self.discard_if_deleted(idx) {
                continue;
            }
            if let Some(item) = self.clean_copy(idx) {
                batch.push(item);
            }
        }
        if batch.is_empty() {
            return Ok(0);
        }

        // WAL: everything in the batch must be covered by durable log
        let max_lsn = batch.iter().map(|item| item.copy.page_lsn()).max().unwrap();
        self.wal.flush(max_lsn)?;

        // write-order dependencies: a page whose prerequisite is dirty
        // and not ordered earlier in this batch is deferred a pass
        let in_batch: Vec<PageId> = batch.iter().map(|item| item.pid).collect();
        let mut ordered: Vec<WriteItem> = Vec::new();
        let mut deferred = 0usize;
        for item in batch {
            match self.wod_blocker(item.pid) {
                Some(dep) => {
                    let dep_pos = in_batch.iter().position(|p| *p == dep);
                    let my_pos = in_batch.iter().position(|p| *p == item.pid);
                    let dep_still_dirty = self
                        .table
                        .get(&dep)
                        .map(|didx| self.frames[didx].cb.dirty.load(Ordering::Acquire))
                        .unwrap_or(false);
                    if dep_still_dirty && (dep_pos.is_none() || dep_pos > my_pos) {
                        deferred += 1;
                        continue;
                    }
                    ordered.push(item);
                }
                None => ordered.push(item),
            }
        }

        let count = ordered.len();
        {
            let pages: Vec<(PageId, &PageBuf)> =
                ordered.iter().map(|item| (item.pid, &item.copy)).collect();
            self.volume.write_many(&pages)?;
            self.volume.sync()?;
        }
        for item in &ordered {
            self.finish_clean(item.idx, item.pid, item.copied_lsn);
        }
        debug!("cleaner wrote {} pages ({} deferred)", count, deferred);
        Ok(count)
    }

    /// Snapshot a dirty page into a scratch buffer with all swizzled
    /// pointers translated back to page ids. The in-frame page is never
    /// mutated for cleaning.
    fn clean_copy(&self, idx: usize) -> Option<WriteItem> {
        let frame = &self.frames[idx];
        if !frame.latch.try_s() {
            return None;
        }
        if !frame.cb.used.load(Ordering::Acquire) || !frame.cb.dirty.load(Ordering::Acquire) {
            frame.latch.release_s();
            return None;
        }
        let pid = frame.cb.pid();
        let mut copy = PageBuf::new();
        copy.copy_from(unsafe { frame.page_ref() });

        // translate pointers while still under the latch: unswizzling
        // elsewhere requires this page exclusively, so the referenced
        // frames cannot be recycled under us here
        if copy.tag() == tag::T_BTREE && !copy.is_leaf() {
            for slot in 0..copy.user_slot_count() {
                let ptr = copy.child_ptr_at(slot);
                if ptr_is_swizzled(ptr as u32) {
                    let child_pid = self.frames[ptr_to_frame(ptr as u32)].cb.pid();
                    copy.set_child_ptr_at(slot, child_pid.to_u64());
                }
            }
        }
        frame.latch.release_s();
        copy.update_checksum();
        let copied_lsn = copy.page_lsn();
        Some(WriteItem {
            idx,
            pid,
            copy,
            copied_lsn,
        })
    }

    /// Mark the frame clean if it was not re-dirtied since the copy.
    fn finish_clean(&self, idx: usize, pid: PageId, copied_lsn: Lsn) {
        let frame = &self.frames[idx];
        self.clear_wod(pid);
        if !frame.latch.try_s() {
            // re-dirtied or busy; keep dirty with a conservative rec_lsn
            frame.cb.set_rec_lsn(copied_lsn);
            return;
        }
        let current = unsafe { frame.page_ref() }.page_lsn();
        if current == copied_lsn && frame.cb.pid() == pid {
            frame.cb.dirty.store(false, Ordering::Release);
            frame.cb.set_rec_lsn(Lsn::NULL);
        } else {
            frame.cb.set_rec_lsn(copied_lsn);
        }
        frame.latch.release_s();
    }

    /// Pages marked to-be-deleted are dropped, not written; their disk
    /// space was already deallocated under WAL.
    fn discard_if_deleted(&self, idx: usize) -> bool {
        let frame = &self.frames[idx];
        if !frame.latch.try_x() {
            return false;
        }
        let deleted = frame.cb.used.load(Ordering::Acquire)
            && unsafe { frame.page_ref() }.is_to_be_deleted();
        if !deleted {
            frame.latch.release_x();
            return false;
        }
        if !frame.cb.start_eviction() {
            frame.latch.release_x();
            return false;
        }
        let pid = frame.cb.pid();
        self.table.remove(&pid);
        frame.cb.reset();
        frame.latch.release_x();
        self.free_list.lock().unwrap().push(idx);
        debug!("discarded deleted page {}", pid);
        true
    }

    /// Synchronous flush of every dirty page; loops until the pool is
    /// clean. Used by checkpoints and `force_all`.
    pub fn force_all(&self) -> Result<(), DbError> {
        let mut stalls = 0;
        loop {
            let written = self.clean_pass()?;
            if self.dirty_count() == 0 {
                return Ok(());
            }
            if written == 0 {
                // a page can be skipped while a fixer or the background
                // cleaner holds its latch; retry briefly before deciding
                // the dependencies are stuck
                stalls += 1;
                if stalls > 10 {
                    return Err(DbError::internal(
                        "force_all cannot make progress (write-order cycle?)",
                    ));
                }
                std::thread::sleep(Duration::from_millis(10));
            } else {
                stalls = 0;
            }
        }
    }
}
