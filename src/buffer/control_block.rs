//! Per-frame control block. All fields are atomics so readers, writers,
//! the cleaner, and the evicter can inspect them without the frame
//! latch; transitions that matter (pinning, the eviction sentinel) go
//! through CAS.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::{
    vol::{PageId, NULL_PID},
    wal::Lsn,
};

/// `pin_cnt` value marking a frame being evicted; no new pins succeed.
pub const PIN_EVICTING: i32 = -1;

/// Reference counts saturate here; a hot page never counts past this.
pub const REFCOUNT_CAP: u32 = 16;

pub struct ControlBlock {
    pid: AtomicU64,
    pin_cnt: AtomicI32,
    refcount: AtomicU32,
    rec_lsn: AtomicU64,
    page_lsn_loaded: AtomicU64,
    pub dirty: AtomicBool,
    pub in_doubt: AtomicBool,
    pub recovery_undo: AtomicBool,
    pub used: AtomicBool,
    /// Some parent's slot points at this frame by index.
    pub swizzled: AtomicBool,
    /// Number of swizzled pointers inside this page.
    pub swizzled_ptr_cnt: AtomicU32,
}

impl ControlBlock {
    pub fn new() -> Self {
        Self {
            pid: AtomicU64::new(0),
            pin_cnt: AtomicI32::new(0),
            refcount: AtomicU32::new(0),
            rec_lsn: AtomicU64::new(0),
            page_lsn_loaded: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            in_doubt: AtomicBool::new(false),
            recovery_undo: AtomicBool::new(false),
            used: AtomicBool::new(false),
            swizzled: AtomicBool::new(false),
            swizzled_ptr_cnt: AtomicU32::new(0),
        }
    }

    pub fn pid(&self) -> PageId {
        PageId::from_u64(self.pid.load(Ordering::Acquire))
    }

    pub fn set_pid(&self, pid: PageId) {
        self.pid.store(pid.to_u64(), Ordering::Release);
    }

    pub fn pin_count(&self) -> i32 {
        self.pin_cnt.load(Ordering::Acquire)
    }

    /// Pin unless eviction is in progress.
    pub fn pin(&self) -> bool {
        loop {
            let cur = self.pin_cnt.load(Ordering::Acquire);
            if cur < 0 {
                return false;
            }
            if self
                .pin_cnt
                .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn unpin(&self) {
        let prev = self.pin_cnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of unpinned frame (pin_cnt {})", prev);
    }

    /// Claim the frame for eviction: only succeeds from pin_cnt 0.
    pub fn start_eviction(&self) -> bool {
        self.pin_cnt
            .compare_exchange(0, PIN_EVICTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn cancel_eviction(&self) {
        let swapped = self
            .pin_cnt
            .compare_exchange(PIN_EVICTING, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        debug_assert!(swapped, "cancel_eviction without the sentinel");
    }

    pub fn touch(&self) {
        let cur = self.refcount.load(Ordering::Relaxed);
        if cur < REFCOUNT_CAP {
            self.refcount.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    /// Clock second chance: decay and report the old value.
    pub fn decay_refcount(&self) -> u32 {
        let cur = self.refcount.load(Ordering::Relaxed);
        if cur > 0 {
            self.refcount.store(cur / 2, Ordering::Relaxed);
        }
        cur
    }

    pub fn rec_lsn(&self) -> Lsn {
        Lsn::from_u64(self.rec_lsn.load(Ordering::Acquire))
    }

    pub fn set_rec_lsn(&self, lsn: Lsn) {
        self.rec_lsn.store(lsn.to_u64(), Ordering::Release);
    }

    /// First-dirty LSN: only the earliest sticks.
    pub fn set_rec_lsn_if_null(&self, lsn: Lsn) {
        let _ = self.rec_lsn.compare_exchange(
            0,
            lsn.to_u64(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn page_lsn_loaded(&self) -> Lsn {
        Lsn::from_u64(self.page_lsn_loaded.load(Ordering::Acquire))
    }

    pub fn set_page_lsn_loaded(&self, lsn: Lsn) {
        self.page_lsn_loaded.store(lsn.to_u64(), Ordering::Release);
    }

    /// Reinitialize for a fresh page. The caller must hold the eviction
    /// sentinel or have the frame outside the hash table.
    pub fn install(&self, pid: PageId, page_lsn: Lsn) {
        self.set_pid(pid);
        self.refcount.store(1, Ordering::Relaxed);
        self.rec_lsn.store(0, Ordering::Release);
        self.set_page_lsn_loaded(page_lsn);
        self.dirty.store(false, Ordering::Release);
        self.in_doubt.store(false, Ordering::Release);
        self.recovery_undo.store(false, Ordering::Release);
        self.swizzled.store(false, Ordering::Release);
        self.swizzled_ptr_cnt.store(0, Ordering::Release);
        self.used.store(true, Ordering::Release);
        self.pin_cnt.store(0, Ordering::Release);
    }

    /// Clear after eviction. The pin count keeps the eviction sentinel
    /// until `install`, so late fixers holding a stale frame index
    /// cannot pin a frame that sits on the free list.
    pub fn reset(&self) {
        self.set_pid(NULL_PID);
        self.used.store(false, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        self.in_doubt.store(false, Ordering::Release);
        self.swizzled.store(false, Ordering::Release);
        self.swizzled_ptr_cnt.store(0, Ordering::Release);
        self.refcount.store(0, Ordering::Relaxed);
        self.rec_lsn.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_blocks_eviction() {
        let cb = ControlBlock::new();
        assert!(cb.pin());
        assert!(!cb.start_eviction());
        cb.unpin();
        assert!(cb.start_eviction());
        assert!(!cb.pin());
        cb.cancel_eviction();
        assert!(cb.pin());
        cb.unpin();
    }

    #[test]
    fn test_refcount_caps() {
        let cb = ControlBlock::new();
        for _ in 0..100 {
            cb.touch();
        }
        assert_eq!(cb.refcount(), REFCOUNT_CAP);
    }

    #[test]
    fn test_rec_lsn_first_sticks() {
        let cb = ControlBlock::new();
        cb.set_rec_lsn_if_null(Lsn::new(1, 100));
        cb.set_rec_lsn_if_null(Lsn::new(1, 200));
        assert_eq!(cb.rec_lsn(), Lsn::new(1, 100));
    }
}
