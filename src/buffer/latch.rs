//! Reader/writer latch with conditional acquisition, atomic conditional
//! upgrade, downgrade, and an optimistic "Q" ticket mode.
//!
//! Writers are preferred: a waiting writer blocks new readers, which
//! keeps descent latch coupling from starving splits.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Condvar, Mutex,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    S,
    X,
    /// Optimistic: no hold at all, only a version ticket the fixer must
    /// validate after reading.
    Q,
}

#[derive(Default)]
struct LatchState {
    readers: u32,
    writer: bool,
    waiting_writers: u32,
}

pub struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
    /// Bumped on every X acquire and release; a Q ticket is valid only
    /// if the version is unchanged and no writer is in.
    version: AtomicU64,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::default()),
            cond: Condvar::new(),
            version: AtomicU64::new(0),
        }
    }

    pub fn acquire_s(&self) {
        let mut state = self.state.lock().unwrap();
        while state.writer || state.waiting_writers > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.readers += 1;
    }

    pub fn try_s(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.writer || state.waiting_writers > 0 {
            return false;
        }
        state.readers += 1;
        true
    }

    pub fn acquire_x(&self) {
        let mut state = self.state.lock().unwrap();
        state.waiting_writers += 1;
        while state.writer || state.readers > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.waiting_writers -= 1;
        state.writer = true;
        self.version.fetch_add(1, Ordering::Release);
    }

    pub fn try_x(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.writer || state.readers > 0 {
            return false;
        }
        state.writer = true;
        self.version.fetch_add(1, Ordering::Release);
        true
    }

    pub fn release_s(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.readers > 0, "release_s without S hold");
        state.readers -= 1;
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    pub fn release_x(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.writer, "release_x without X hold");
        state.writer = false;
        self.version.fetch_add(1, Ordering::Release);
        self.cond.notify_all();
    }

    /// S → X without a window where the latch is free. Succeeds only if
    /// this thread is the sole reader.
    pub fn try_upgrade(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.readers > 0, "upgrade without S hold");
        if state.readers != 1 || state.writer {
            return false;
        }
        state.readers = 0;
        state.writer = true;
        self.version.fetch_add(1, Ordering::Release);
        true
    }

    /// X → S without releasing.
    pub fn downgrade(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.writer, "downgrade without X hold");
        state.writer = false;
        state.readers = 1;
        self.version.fetch_add(1, Ordering::Release);
        self.cond.notify_all();
    }

    /// A Q-mode ticket, or None while a writer is in.
    pub fn q_ticket(&self) -> Option<u64> {
        let state = self.state.lock().unwrap();
        if state.writer {
            return None;
        }
        Some(self.version.load(Ordering::Acquire))
    }

    /// Validate a Q ticket: no writer has been in since it was taken.
    pub fn validate_q(&self, ticket: u64) -> bool {
        let state = self.state.lock().unwrap();
        !state.writer && self.version.load(Ordering::Acquire) == ticket
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().unwrap().writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_s_then_x_conditional() {
        let latch = Latch::new();
        latch.acquire_s();
        assert!(!latch.try_x());
        assert!(latch.try_s());
        latch.release_s();
        latch.release_s();
        assert!(latch.try_x());
        assert!(!latch.try_s());
        latch.release_x();
    }

    #[test]
    fn test_upgrade_only_sole_reader() {
        let latch = Latch::new();
        latch.acquire_s();
        latch.acquire_s();
        assert!(!latch.try_upgrade());
        latch.release_s();
        assert!(latch.try_upgrade());
        latch.release_x();
    }

    #[test]
    fn test_downgrade() {
        let latch = Latch::new();
        latch.acquire_x();
        latch.downgrade();
        assert!(latch.try_s());
        latch.release_s();
        latch.release_s();
    }

    #[test]
    fn test_q_ticket_invalidated_by_writer() {
        let latch = Latch::new();
        let ticket = latch.q_ticket().unwrap();
        assert!(latch.validate_q(ticket));
        latch.acquire_x();
        latch.release_x();
        assert!(!latch.validate_q(ticket));
    }

    #[test]
    fn test_blocking_x_across_threads() {
        let latch = Arc::new(Latch::new());
        latch.acquire_x();
        let l2 = Arc::clone(&latch);
        let handle = std::thread::spawn(move || {
            l2.acquire_x();
            l2.release_x();
            true
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        latch.release_x();
        assert!(handle.join().unwrap());
    }
}
