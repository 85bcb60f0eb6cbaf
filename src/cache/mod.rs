// Generic TTL cache backing both the per-cluster queue snapshot cache and the in-memory
// decrypted-key store (`crate::auth::keystore`). Each entry remembers when it was inserted;
// staleness is a read-time comparison against the cache's TTL, not an eagerly-expiring timer.

pub mod cluster_status;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};

pub struct Entry<V> {
    pub data: V,
    pub inserted_at: DateTime<Utc>,
}

pub struct Lookup<V> {
    pub valid: bool,
    pub age: Duration,
    pub data: V,
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        TtlCache {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<Lookup<V>> {
        let entries = self.entries.read().expect("ttl cache lock poisoned");
        entries.get(key).map(|e| {
            let age = (Utc::now() - e.inserted_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            Lookup {
                valid: age < self.ttl,
                age,
                data: e.data.clone(),
            }
        })
    }

    pub fn set(&self, key: K, data: V) {
        let mut entries = self.entries.write().expect("ttl cache lock poisoned");
        entries.insert(
            key,
            Entry {
                data,
                inserted_at: Utc::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        let mut entries = self.entries.write().expect("ttl cache lock poisoned");
        entries.remove(key);
    }

    pub fn invalidate_all(&self) {
        let mut entries = self.entries.write().expect("ttl cache lock poisoned");
        entries.clear();
    }

    /// Remove every entry whose age already exceeds `ttl`, used by the keystore's periodic sweep.
    pub fn sweep_expired(&self) {
        let mut entries = self.entries.write().expect("ttl cache lock poisoned");
        let ttl = self.ttl;
        entries.retain(|_, e| {
            let age = (Utc::now() - e.inserted_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            age < ttl
        });
    }

    pub fn keys(&self) -> Vec<K> {
        let entries = self.entries.read().expect("ttl cache lock poisoned");
        entries.keys().cloned().collect()
    }
}
