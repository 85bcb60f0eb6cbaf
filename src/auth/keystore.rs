// In-memory, TTL-bounded store of decrypted private-key material (spec §6 "Persisted state").
// Decrypted bytes never touch disk; they live here for at most `session_key_ttl` (default 14
// days per spec), cleared on logout or expiry, with a periodic sweep every 5 minutes evicting
// anything the TTL has already caught up with.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::TtlCache;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct SessionKeyStore {
    cache: TtlCache<String, String>,
}

impl SessionKeyStore {
    pub fn new(ttl: Duration) -> Self {
        SessionKeyStore {
            cache: TtlCache::new(ttl),
        }
    }

    /// Record `username`'s decrypted private key PEM, e.g. right after a successful login or
    /// `/auth/unlock` call.
    pub fn put(&self, username: &str, private_key_pem: String) {
        self.cache.set(username.to_string(), private_key_pem);
    }

    /// Fetch the decrypted key if still within its TTL. A stale-but-present entry is treated as
    /// absent; the next sweep will evict it.
    pub fn get(&self, username: &str) -> Option<String> {
        let lookup = self.cache.get(&username.to_string())?;
        if lookup.valid {
            Some(lookup.data)
        } else {
            None
        }
    }

    /// Logout: drop a single user's decrypted key immediately.
    pub fn clear(&self, username: &str) {
        self.cache.invalidate(&username.to_string());
    }

    pub fn spawn_sweeper(self: &Arc<Self>) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                store.cache.sweep_expired();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_returns_fresh_key() {
        let store = SessionKeyStore::new(Duration::from_secs(3600));
        store.put("alice", "pem-bytes".to_string());
        assert_eq!(store.get("alice").as_deref(), Some("pem-bytes"));
    }

    #[test]
    fn expired_key_reads_as_absent() {
        let store = SessionKeyStore::new(Duration::ZERO);
        store.put("alice", "pem-bytes".to_string());
        assert!(store.get("alice").is_none());
    }

    #[test]
    fn clear_drops_the_entry() {
        let store = SessionKeyStore::new(Duration::from_secs(3600));
        store.put("alice", "pem-bytes".to_string());
        store.clear("alice");
        assert!(store.get("alice").is_none());
    }
}
