//! Eviction: a hierarchical clock hand walking the tree shape, plus a
//! random policy for experiments.
//!
//! The walk holds only conditional latches, so it cannot deadlock with
//! fixers; it may skip everything and evict nothing, in which case the
//! caller retries with higher urgency. Double-visits across concurrent
//! rounds are harmless.

use std::sync::atomic::Ordering;

use log::{debug, trace};
use rand::Rng;

use crate::{
    buffer::{
        latch::LatchMode,
        pool::{BufferPool, EvictPolicy, PageGuard},
    },
    utils::HandyRwLock,
    vol::page_id::{ptr_is_swizzled, ptr_to_frame},
    vol::PageId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EvictUrgency {
    /// Opportunistic; respects reference counts.
    Normal,
    /// Free list is low; decays reference counts faster.
    Eager,
    /// Caller is blocked; ignores reference counts, unswizzles.
    Urgent,
    /// Evict everything evictable (shutdown, tests).
    Complete,
}

/// Maximum clock-path depth (volume, store, then child ordinals).
const MAX_DEPTH: usize = 10;

struct EvictionContext {
    urgency: EvictUrgency,
    preferred: usize,
    evicted: usize,
    path: Vec<u32>,
}

impl EvictionContext {
    fn pos(&self, depth: usize) -> u32 {
        self.path.get(depth).copied().unwrap_or(0)
    }

    fn set_pos(&mut self, depth: usize, v: u32) {
        if depth < self.path.len() {
            self.path[depth] = v;
            for p in self.path.iter_mut().skip(depth + 1) {
                *p = 0;
            }
        }
    }

    fn done(&self) -> bool {
        self.evicted >= self.preferred
    }
}

impl BufferPool {
    /// One best-effort eviction drive. Returns the number of frames
    /// pushed to the free list.
    pub fn evict(&self, urgency: EvictUrgency, preferred_count: usize) -> usize {
        let mut evicted = match self.policy {
            EvictPolicy::Random => self.evict_random(urgency, preferred_count),
            _ => self.evict_clock(urgency, preferred_count),
        };
        if evicted < preferred_count && urgency >= EvictUrgency::Urgent {
            // the tree walk cannot reach pages whose parent is itself
            // gone; a flat sweep over the frame table can
            evicted += self.evict_flat(preferred_count - evicted);
        }
        if evicted == 0 && urgency >= EvictUrgency::Eager {
            // everything evictable is dirty; get the cleaner moving
            self.kick_cleaner();
        }
        evicted
    }

    /// Frame-order sweep, used as the urgent fallback. Skips frames a
    /// swizzled pointer references (those are reachable through their
    /// resident parent, which the clock walk handles).
    fn evict_flat(&self, preferred_count: usize) -> usize {
        let mut evicted = 0;
        for idx in 0..self.frames.len() {
            if evicted >= preferred_count {
                break;
            }
            let frame = &self.frames[idx];
            if !frame.latch.try_x() {
                continue;
            }
            let ok = frame.cb.used.load(Ordering::Acquire)
                && frame.cb.pin_count() == 0
                && !frame.cb.dirty.load(Ordering::Acquire)
                && !frame.cb.swizzled.load(Ordering::Acquire)
                && frame.cb.swizzled_ptr_cnt.load(Ordering::Acquire) == 0;
            if !ok || !frame.cb.start_eviction() {
                frame.latch.release_x();
                continue;
            }
            let pid = frame.cb.pid();
            self.table.remove(&pid);
            frame.cb.reset();
            frame.latch.release_x();
            self.free_list.lock().unwrap().push(idx);
            evicted += 1;
        }
        evicted
    }

    fn evict_clock(&self, urgency: EvictUrgency, preferred_count: usize) -> usize {
        let path = self.clockhand.lock().unwrap().clone();
        let mut ctx = EvictionContext {
            urgency,
            preferred: preferred_count,
            evicted: 0,
            path,
        };

        let rounds = match urgency {
            EvictUrgency::Normal => 1,
            EvictUrgency::Eager => 2,
            EvictUrgency::Urgent => 3,
            EvictUrgency::Complete => 20,
        };

        for _ in 0..rounds {
            let stores = self.stores.rl().clone();
            if stores.is_empty() {
                break;
            }
            let start = ctx.pos(1) as usize % stores.len();
            for i in 0..stores.len() {
                let root_pid = stores[(start + i) % stores.len()];
                ctx.set_pos(1, ((start + i) % stores.len()) as u32);
                let root_idx = match self.table.get(&root_pid) {
                    Some(idx) => idx,
                    None => continue,
                };
                let mut root = match self.fix_resident(root_idx, Some(root_pid), LatchMode::S, true)
                {
                    Ok(Some(guard)) => guard,
                    _ => continue,
                };
                self.evict_walk(&mut root, 2, &mut ctx);
                drop(root);
                if ctx.done() {
                    break;
                }
            }
            if ctx.done() {
                break;
            }
        }

        *self.clockhand.lock().unwrap() = ctx.path.clone();
        trace!("eviction round at {:?}: {} freed", urgency, ctx.evicted);
        ctx.evicted
    }

    fn evict_walk(&self, parent: &mut PageGuard<'_>, depth: usize, ctx: &mut EvictionContext) {
        if parent.page().is_leaf() || depth >= MAX_DEPTH {
            return;
        }
        let nslots = parent.page().user_slot_count();
        if nslots == 0 {
            return;
        }
        let start = ctx.pos(depth) as usize % nslots;
        for i in 0..nslots {
            if ctx.done() {
                return;
            }
            let slot = (start + i) % nslots;
            ctx.set_pos(depth, slot as u32);

            let ptr = parent.page().child_ptr_at(slot);
            let idx = if ptr_is_swizzled(ptr as u32) {
                ptr_to_frame(ptr as u32)
            } else {
                match self.table.get(&PageId::from_u64(ptr)) {
                    Some(idx) => idx,
                    None => continue, // not resident
                }
            };

            let child_is_branch = parent.page().level() > 2;
            if child_is_branch {
                // inner node: descend first, evict it only once nothing
                // below is swizzle-referenced through it
                if let Ok(Some(mut child)) = self.fix_resident(idx, None, LatchMode::S, true) {
                    self.evict_walk(&mut child, depth + 1, ctx);
                }
                if self.frames[idx].cb.swizzled_ptr_cnt.load(Ordering::Acquire) == 0 {
                    self.try_evict_one(parent, slot, idx, ctx);
                }
                continue;
            }

            self.try_evict_one(parent, slot, idx, ctx);
        }
    }

    /// Attempt to evict the frame `idx`, reached through `parent`'s
    /// `slot`. Conditional at every step; any contention skips.
    fn try_evict_one(
        &self,
        parent: &mut PageGuard<'_>,
        slot: usize,
        idx: usize,
        ctx: &mut EvictionContext,
    ) {
        let frame = &self.frames[idx];
        if !frame.latch.try_x() {
            return;
        }

        let give_up = |f: &crate::buffer::pool::Frame| f.latch.release_x();

        if !frame.cb.used.load(Ordering::Acquire) || frame.cb.pin_count() != 0 {
            give_up(frame);
            return;
        }
        if frame.cb.dirty.load(Ordering::Acquire) {
            if ctx.urgency >= EvictUrgency::Eager {
                self.kick_cleaner();
            }
            give_up(frame);
            return;
        }
        if frame.cb.swizzled_ptr_cnt.load(Ordering::Acquire) > 0 {
            give_up(frame);
            return;
        }
        // clock second chance below URGENT
        if ctx.urgency < EvictUrgency::Urgent {
            let hot = match ctx.urgency {
                EvictUrgency::Normal => frame.cb.decay_refcount() > 0,
                _ => frame.cb.decay_refcount() >= 8,
            };
            if hot {
                give_up(frame);
                return;
            }
        }

        // unswizzling and the EMLSN update need the parent exclusively
        let parent_was_s = parent.mode() == LatchMode::S;
        if parent_was_s && !parent.try_upgrade() {
            give_up(frame);
            return;
        }

        let child_pid = frame.cb.pid();
        let child_lsn = unsafe { frame.page_ref() }.page_lsn();
        let ptr = parent.page().child_ptr_at(slot);
        if ptr_is_swizzled(ptr as u32) {
            parent.page_mut().set_child_ptr_at(slot, child_pid.to_u64());
            parent.frame().cb.swizzled_ptr_cnt.fetch_sub(1, Ordering::AcqRel);
            frame.cb.swizzled.store(false, Ordering::Release);
        }
        // bound single-page recovery for the departing child
        parent.page_mut().set_emlsn_at(slot, child_lsn);
        parent.mark_dirty();
        if parent_was_s {
            parent.downgrade();
        }

        if !frame.cb.start_eviction() {
            // a fixer pinned while we deliberated; the unswizzle stands
            give_up(frame);
            return;
        }
        self.table.remove(&child_pid);
        frame.cb.reset();
        frame.latch.release_x();
        self.free_list.lock().unwrap().push(idx);
        ctx.evicted += 1;
        debug!("evicted page {} from frame {}", child_pid, idx);
    }

    /// Random replacement: probe random frames. Skips anything
    /// swizzle-referenced, since there is no parent at hand to
    /// unswizzle through.
    fn evict_random(&self, urgency: EvictUrgency, preferred_count: usize) -> usize {
        let mut rng = rand::thread_rng();
        let mut evicted = 0;
        let probes = self.frames.len() * 2;
        for _ in 0..probes {
            if evicted >= preferred_count {
                break;
            }
            let idx = rng.gen_range(0, self.frames.len());
            let frame = &self.frames[idx];
            if !frame.latch.try_x() {
                continue;
            }
            let ok = frame.cb.used.load(Ordering::Acquire)
                && frame.cb.pin_count() == 0
                && !frame.cb.dirty.load(Ordering::Acquire)
                && !frame.cb.swizzled.load(Ordering::Acquire)
                && frame.cb.swizzled_ptr_cnt.load(Ordering::Acquire) == 0
                && (urgency >= EvictUrgency::Urgent || frame.cb.decay_refcount() == 0);
            if !ok {
                frame.latch.release_x();
                continue;
            }
            if !frame.cb.start_eviction() {
                frame.latch.release_x();
                continue;
            }
            let pid = frame.cb.pid();
            self.table.remove(&pid);
            frame.cb.reset();
            frame.latch.release_x();
            self.free_list.lock().unwrap().push(idx);
            evicted += 1;
        }
        evicted
    }
}
