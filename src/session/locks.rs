// Named, exclusive, non-reentrant locks (spec §3 "Lock", §5 "Lock set"). Acquire fails
// immediately when the name is already held; there is no queuing. Released by dropping the
// returned guard, which covers every exit path (success, error, early return) for free.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

pub struct LockSet {
    held: Arc<DashMap<String, ()>>,
}

pub struct LockGuard<'a> {
    held: Arc<DashMap<String, ()>>,
    name: String,
    _marker: std::marker::PhantomData<&'a ()>,
}

impl LockSet {
    pub fn new() -> Self {
        LockSet {
            held: Arc::new(DashMap::new()),
        }
    }

    pub fn acquire(&self, name: &str) -> Option<LockGuard<'_>> {
        match self.held.entry(name.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(v) => {
                v.insert(());
                Some(LockGuard {
                    held: self.held.clone(),
                    name: name.to_string(),
                    _marker: std::marker::PhantomData,
                })
            }
        }
    }
}

impl Default for LockSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.held.remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let locks = LockSet::new();
        let _g1 = locks.acquire("launch:a-gemini-vscode").unwrap();
        assert!(locks.acquire("launch:a-gemini-vscode").is_none());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let locks = LockSet::new();
        {
            let _g = locks.acquire("launch:a-gemini-vscode").unwrap();
        }
        assert!(locks.acquire("launch:a-gemini-vscode").is_some());
    }

    #[test]
    fn unrelated_keys_never_contend() {
        let locks = LockSet::new();
        let _g1 = locks.acquire("launch:a-gemini-vscode").unwrap();
        assert!(locks.acquire("launch:a-saga-vscode").is_some());
    }
}
