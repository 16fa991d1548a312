//! The lock oracle: a key-hash lock table with shared/exclusive modes
//! and blocking acquisition under a timeout.
//!
//! Locks are logical (keys and key ranges), never pages; page latches
//! are released when a leaf operation completes, locks only at commit
//! or abort.

use std::{
    collections::{HashMap, HashSet},
    hash::Hasher,
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use log::trace;

use crate::{error::DbError, types::DbResult};

pub type LockId = u64;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Lock {
    SLock,
    XLock,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}

impl Permission {
    pub fn to_lock(&self) -> Lock {
        match self {
            Permission::ReadOnly => Lock::SLock,
            Permission::ReadWrite => Lock::XLock,
        }
    }
}

pub fn key_lock_id(store: u32, key: &[u8]) -> LockId {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    hasher.write_u32(store);
    hasher.write(key);
    hasher.finish()
}

#[derive(Default)]
struct LockMaps {
    s_holders: HashMap<LockId, HashSet<u64>>,
    x_holders: HashMap<LockId, u64>,
    held: HashMap<u64, HashSet<LockId>>,
}

impl LockMaps {
    /// Idempotent grant attempt.
    fn try_add(&mut self, tid: u64, lock: Lock, id: LockId) -> bool {
        if let Some(&owner) = self.x_holders.get(&id) {
            if owner != tid {
                return false;
            }
        }
        match lock {
            Lock::SLock => {
                self.s_holders.entry(id).or_insert_with(HashSet::new).insert(tid);
            }
            Lock::XLock => {
                if let Some(readers) = self.s_holders.get(&id) {
                    if readers.iter().any(|&r| r != tid) {
                        return false;
                    }
                }
                self.x_holders.insert(id, tid);
            }
        }
        self.held.entry(tid).or_insert_with(HashSet::new).insert(id);
        true
    }

    fn release_one(&mut self, tid: u64, id: LockId) {
        if let Some(readers) = self.s_holders.get_mut(&id) {
            readers.remove(&tid);
            if readers.is_empty() {
                self.s_holders.remove(&id);
            }
        }
        if self.x_holders.get(&id) == Some(&tid) {
            self.x_holders.remove(&id);
        }
    }
}

pub struct LockTable {
    maps: Mutex<LockMaps>,
    cond: Condvar,
    timeout: Duration,
}

impl LockTable {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            maps: Mutex::new(LockMaps::default()),
            cond: Condvar::new(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Block until granted or the timeout expires (Conflict error).
    pub fn acquire(&self, tid: u64, store: u32, key: &[u8], lock: Lock) -> DbResult {
        let id = key_lock_id(store, key);
        let start = Instant::now();
        let mut maps = self.maps.lock().unwrap();
        loop {
            if maps.try_add(tid, lock, id) {
                trace!("tid {} granted {:?} on {:x}", tid, lock, id);
                return Ok(());
            }
            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(DbError::conflict(&format!(
                    "lock timeout: tid {} waiting for {:?} on key {:?}",
                    tid, lock, key
                )));
            }
            let (guard, _) = self
                .cond
                .wait_timeout(maps, self.timeout - elapsed)
                .unwrap();
            maps = guard;
        }
    }

    pub fn release_all(&self, tid: u64) {
        let mut maps = self.maps.lock().unwrap();
        if let Some(ids) = maps.held.remove(&tid) {
            for id in ids {
                maps.release_one(tid, id);
            }
        }
        self.cond.notify_all();
    }

    /// Whether anyone holds a lock on the key. Ghost reclamation skips
    /// keys whose delete might still roll back.
    pub fn is_locked(&self, store: u32, key: &[u8]) -> bool {
        let id = key_lock_id(store, key);
        let maps = self.maps.lock().unwrap();
        maps.x_holders.contains_key(&id)
            || maps.s_holders.get(&id).map(|s| !s.is_empty()).unwrap_or(false)
    }

    pub fn held_count(&self, tid: u64) -> usize {
        self.maps
            .lock()
            .unwrap()
            .held
            .get(&tid)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_then_exclusive() {
        let table = LockTable::new(50);
        table.acquire(1, 1, b"k", Lock::SLock).unwrap();
        table.acquire(2, 1, b"k", Lock::SLock).unwrap();
        // exclusive blocks until timeout
        let err = table.acquire(3, 1, b"k", Lock::XLock).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);

        table.release_all(1);
        table.release_all(2);
        table.acquire(3, 1, b"k", Lock::XLock).unwrap();
        assert!(table.is_locked(1, b"k"));
        table.release_all(3);
        assert!(!table.is_locked(1, b"k"));
    }

    #[test]
    fn test_reentrant_upgrade() {
        let table = LockTable::new(50);
        table.acquire(1, 1, b"k", Lock::SLock).unwrap();
        // the sole reader may upgrade
        table.acquire(1, 1, b"k", Lock::XLock).unwrap();
        assert_eq!(table.held_count(1), 1);
        table.release_all(1);
    }

    #[test]
    fn test_release_wakes_waiter() {
        use std::sync::Arc;
        let table = Arc::new(LockTable::new(2000));
        table.acquire(1, 1, b"k", Lock::XLock).unwrap();
        let t2 = Arc::clone(&table);
        let handle = std::thread::spawn(move || t2.acquire(2, 1, b"k", Lock::XLock).is_ok());
        std::thread::sleep(Duration::from_millis(30));
        table.release_all(1);
        assert!(handle.join().unwrap());
    }
}
