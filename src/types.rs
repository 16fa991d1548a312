use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::RwLock,
};

use crate::{error::DbError, utils::HandyRwLock};

pub type DbResult = Result<(), DbError>;

const SHARD_COUNT: usize = 16;

/// A sharded hash map for concurrent page-table style lookups. Each
/// shard is an independent `RwLock<HashMap>`; a key always maps to the
/// same shard.
pub struct ConcurrentHashMap<K, V> {
    shards: Vec<RwLock<HashMap<K, V>>>,
}

impl<K: Hash + Eq + Clone, V: Clone> ConcurrentHashMap<K, V> {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(RwLock::new(HashMap::new()));
        }
        Self { shards }
    }

    fn shard(&self, key: &K) -> &RwLock<HashMap<K, V>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.shard(key).rl().get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).wl().insert(key, value)
    }

    /// Insert only if the key is absent. Returns the resident value on
    /// conflict, used to resolve a race between two loaders of the same
    /// page.
    pub fn insert_if_absent(&self, key: K, value: V) -> Result<(), V> {
        let mut shard = self.shard(&key).wl();
        if let Some(existing) = shard.get(&key) {
            return Err(existing.clone());
        }
        shard.insert(key, value);
        Ok(())
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).wl().remove(key)
    }

    pub fn keys(&self) -> Vec<K> {
        let mut keys = vec![];
        for shard in &self.shards {
            keys.extend(shard.rl().keys().cloned());
        }
        keys
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.rl().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.wl().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_if_absent_races() {
        let map: ConcurrentHashMap<u64, usize> = ConcurrentHashMap::new();
        assert!(map.insert_if_absent(1, 10).is_ok());
        assert_eq!(map.insert_if_absent(1, 20), Err(10));
        assert_eq!(map.get(&1), Some(10));
        map.remove(&1);
        assert!(map.get(&1).is_none());
    }
}
