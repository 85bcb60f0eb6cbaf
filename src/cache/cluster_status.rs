// Per-cluster TTL cache of queue snapshots (spec's "status cache" component). Wraps the generic
// `TtlCache` with the merge-and-refresh-stale-in-parallel policy: a `cluster-status` read checks
// every configured cluster independently, refreshes only the stale ones concurrently, and returns
// a response carrying a `cached` flag plus the oldest age among the clusters served.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;

use crate::jobs::{Ide, JobRecord};

use super::TtlCache;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterStatus {
    pub jobs: HashMap<Ide, JobRecord>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub clusters: HashMap<String, ClusterStatus>,
    pub cached: bool,
    pub oldest_age_secs: u64,
}

pub struct ClusterStatusCache {
    cache: TtlCache<String, ClusterStatus>,
}

impl ClusterStatusCache {
    pub fn new(ttl: Duration) -> Self {
        ClusterStatusCache {
            cache: TtlCache::new(ttl),
        }
    }

    pub fn invalidate(&self, cluster: &str) {
        self.cache.invalidate(&cluster.to_string());
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn set(&self, cluster: &str, status: ClusterStatus) {
        self.cache.set(cluster.to_string(), status);
    }

    /// Serve every cluster in `clusters` from cache when fresh, refreshing stale ones in
    /// parallel via `fetch`. `force_refresh` bypasses freshness entirely (the `?refresh=true`
    /// query parameter).
    pub async fn get_or_refresh<F, Fut>(
        &self,
        clusters: &[String],
        force_refresh: bool,
        fetch: F,
    ) -> StatusResponse
    where
        F: Fn(String) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ClusterStatus> + Send + 'static,
    {
        let mut result = HashMap::new();
        let mut oldest = Duration::ZERO;
        let mut any_cached = false;

        let mut to_refresh = Vec::new();
        for cluster in clusters {
            match self.cache.get(cluster) {
                Some(lookup) if lookup.valid && !force_refresh => {
                    any_cached = true;
                    oldest = oldest.max(lookup.age);
                    result.insert(cluster.clone(), lookup.data);
                }
                _ => to_refresh.push(cluster.clone()),
            }
        }

        if !to_refresh.is_empty() {
            let fetched = futures_join_all(to_refresh.iter().cloned().map(|c| {
                let fetch = fetch.clone();
                async move {
                    let status = fetch(c.clone()).await;
                    (c, status)
                }
            }))
            .await;
            for (cluster, status) in fetched {
                self.cache.set(cluster.clone(), status.clone());
                result.insert(cluster, status);
            }
        }

        StatusResponse {
            clusters: result,
            cached: any_cached,
            oldest_age_secs: oldest.as_secs(),
        }
    }
}

/// Drives a dynamically-sized batch of futures concurrently via `JoinSet`, avoiding a dependency
/// on `futures::future::join_all` for this one call site.
async fn futures_join_all<T, Fut>(iter: impl IntoIterator<Item = Fut>) -> Vec<T>
where
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let mut set = tokio::task::JoinSet::new();
    for fut in iter {
        set.spawn(fut);
    }
    let mut out = Vec::new();
    while let Some(res) = set.join_next().await {
        if let Ok(v) = res {
            out.push(v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn refreshes_only_stale_clusters() {
        let cache = ClusterStatusCache::new(Duration::from_secs(3600));
        cache.set("gemini", ClusterStatus::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let clusters = vec!["gemini".to_string(), "saga".to_string()];
        let calls2 = calls.clone();
        let resp = cache
            .get_or_refresh(&clusters, false, move |_c| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ClusterStatus::default()
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(resp.cached);
        assert_eq!(resp.clusters.len(), 2);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_cache() {
        let cache = ClusterStatusCache::new(Duration::from_secs(3600));
        cache.set("gemini", ClusterStatus::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let clusters = vec!["gemini".to_string()];
        let calls2 = calls.clone();
        let _ = cache
            .get_or_refresh(&clusters, true, move |_c| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ClusterStatus::default()
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
