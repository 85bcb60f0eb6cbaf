// Session state machine: owns every session's identity, state, and lifecycle, and coordinates
// launch, reconnect, switch, and stop flows (`launch.rs`, `stop.rs`). The table itself is a
// `DashMap` keyed by (user, cluster, ide) so unrelated keys never contend; per-key mutual
// exclusion across an entire launch is a separate named lock set, not the map's own sharding.

pub mod launch;
pub mod locks;
pub mod stop;
pub mod switch;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::cache::cluster_status::ClusterStatusCache;
use crate::jobs::{GpuSpec, JobController};
pub use crate::tunnel::SessionKey;
use crate::tunnel::TunnelManager;

use locks::LockSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Starting,
    Pending,
    Running,
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Cancelled,
    Timeout,
    TunnelLost,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Session {
    pub status: SessionStatus,
    pub job_id: Option<String>,
    pub auth_token: Option<String>,
    pub compute_node: Option<String>,
    pub submitted_at: Option<chrono::DateTime<chrono::Utc>>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub estimated_start_time: Option<String>,
    pub release_version: Option<String>,
    pub gpu: Option<GpuSpec>,
    pub account: Option<String>,
    pub cpus: Option<u32>,
    pub memory_gb: Option<u32>,
    pub walltime_hours: Option<u32>,
    pub error: Option<String>,
    pub end_reason: Option<EndReason>,
}

impl Session {
    /// spec §3: "A session exists if any of its attributes is non-default."
    pub fn exists(&self) -> bool {
        self.status != SessionStatus::Idle
            || self.job_id.is_some()
            || self.compute_node.is_some()
            || self.error.is_some()
    }
}

pub struct SessionManager {
    sessions: dashmap::DashMap<SessionKey, Session>,
    active: dashmap::DashMap<String, SessionKey>,
    locks: LockSet,
    cleared_tx: broadcast::Sender<(SessionKey, EndReason)>,
    pub job_controller: Arc<dyn JobController>,
    pub tunnels: Arc<TunnelManager>,
    pub status_cache: Arc<ClusterStatusCache>,
}

impl SessionManager {
    pub fn new(
        job_controller: Arc<dyn JobController>,
        tunnels: Arc<TunnelManager>,
        status_cache: Arc<ClusterStatusCache>,
    ) -> Self {
        let (cleared_tx, _) = broadcast::channel(256);
        SessionManager {
            sessions: dashmap::DashMap::new(),
            active: dashmap::DashMap::new(),
            locks: LockSet::new(),
            cleared_tx,
            job_controller,
            tunnels,
            status_cache,
        }
    }

    pub fn subscribe_cleared(&self) -> broadcast::Receiver<(SessionKey, EndReason)> {
        self.cleared_tx.subscribe()
    }

    pub fn get_or_create(&self, key: &SessionKey) -> Session {
        self.sessions.entry(key.clone()).or_default().value().clone()
    }

    pub fn get(&self, key: &SessionKey) -> Option<Session> {
        self.sessions.get(key).map(|e| e.value().clone())
    }

    pub fn get_all_for_user(&self, user: &str) -> HashMap<SessionKey, Session> {
        self.sessions
            .iter()
            .filter(|e| e.key().user == user)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn update(&self, key: &SessionKey, f: impl FnOnce(&mut Session)) {
        let mut entry = self.sessions.entry(key.clone()).or_default();
        f(&mut entry);
    }

    pub fn clear(&self, key: &SessionKey, end_reason: EndReason) {
        self.sessions.insert(
            key.clone(),
            Session {
                end_reason: Some(end_reason),
                ..Session::default()
            },
        );
        let _ = self.cleared_tx.send((key.clone(), end_reason));
    }

    /// Resets a session that failed mid-launch back to `idle` with `error` set, spec §7:
    /// `TransportError`/`SubmitError`/`Timeout` all "reset to idle with error"; `TunnelError`
    /// "remains idle" with a user-friendly message. Unlike `clear`, this does not fire the
    /// "session cleared" broadcast -- the session was never running, so nothing (tunnel,
    /// analytics) needs to be told to tear anything down.
    pub fn reset_idle_with_error(&self, key: &SessionKey, error: String) {
        self.sessions.insert(
            key.clone(),
            Session {
                status: SessionStatus::Idle,
                error: Some(error),
                ..Session::default()
            },
        );
    }

    pub fn set_active_session(&self, user: &str, key: SessionKey) {
        self.active.insert(user.to_string(), key);
    }

    pub fn get_active_session(&self, user: &str) -> Option<SessionKey> {
        self.active.get(user).map(|e| e.value().clone())
    }

    pub fn acquire_lock(&self, name: &str) -> Option<locks::LockGuard<'_>> {
        self.locks.acquire(name)
    }

    pub fn launch_lock_name(key: &SessionKey) -> String {
        format!("launch:{}-{}-{}", key.user, key.cluster, key.ide)
    }

    /// The tunnel's own exit handler invokes this, spec §4.5 step 9 / §4.3 Stop protocol: if the
    /// session this tunnel belonged to is still `running`, the tunnel dying out from under it
    /// (not via an explicit `stop`) clears the session back to idle.
    pub fn handle_tunnel_exit(&self, key: &SessionKey) {
        if let Some(session) = self.get(key) {
            if session.status == SessionStatus::Running {
                self.clear(key, EndReason::TunnelLost);
            }
        }
    }
}
