// HTTP/SSE surface (spec §6). Axum router wiring lives here; handler bodies live in `handlers`.
// Every route sits under `/api`, matching the table in spec §6 exactly.

mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{SessionKeyStore, UserStore};
use crate::cache::cluster_status::ClusterStatusCache;
use crate::config::Config;
use crate::jobs::JobController;
use crate::session::SessionManager;
use crate::tunnel::TunnelManager;

pub struct AppState {
    pub config: Config,
    pub sessions: Arc<SessionManager>,
    pub users: Arc<UserStore>,
    pub keys: Arc<SessionKeyStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        job_controller: Arc<dyn JobController>,
        tunnels: Arc<TunnelManager>,
        tunnel_exits: tokio::sync::mpsc::UnboundedReceiver<crate::tunnel::SessionKey>,
        users: Arc<UserStore>,
        keys: Arc<SessionKeyStore>,
    ) -> Arc<AppState> {
        let status_cache = Arc::new(ClusterStatusCache::new(config.status_cache_ttl));
        let sessions = Arc::new(SessionManager::new(job_controller, tunnels, status_cache));
        spawn_tunnel_exit_watcher(sessions.clone(), tunnel_exits);
        Arc::new(AppState {
            config,
            sessions,
            users,
            keys,
        })
    }
}

/// Drains the tunnel manager's exit channel for the lifetime of the process, driving each
/// session whose tunnel died on its own back to idle (spec §4.5 step 9).
fn spawn_tunnel_exit_watcher(
    sessions: Arc<SessionManager>,
    mut tunnel_exits: tokio::sync::mpsc::UnboundedReceiver<crate::tunnel::SessionKey>,
) {
    tokio::spawn(async move {
        while let Some(key) = tunnel_exits.recv().await {
            sessions.handle_tunnel_exit(&key);
        }
    });
}

/// Context attached to a request by the (out-of-scope) authentication provider. Handlers depend
/// on this extractor shape, not on any particular auth implementation, per spec §6.1.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub username: String,
    pub hpc_user: String,
}

impl AppState {
    /// Key selection, spec §4.1: the authenticated user's own decrypted key if unlocked in the
    /// session-key store, else the first configured admin's, else failure.
    pub fn resolve_identity(&self, user: &CurrentUser) -> crate::error::Result<crate::ssh::Identity> {
        if let Some(pem) = self.keys.get(&user.username) {
            return Ok(crate::ssh::Identity::for_user(&user.hpc_user, &user.username, pem));
        }
        for admin in &self.config.admin_users {
            if let Some(pem) = self.keys.get(admin) {
                return Ok(crate::ssh::Identity::admin_fallback(&user.hpc_user, pem));
            }
        }
        Err(crate::error::GatewayError::Transport(
            "no SSH key configured".to_string(),
        ))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(handlers::status))
        .route("/api/cluster-status", get(handlers::cluster_status))
        .route("/api/cluster-health/:hpc", get(handlers::cluster_health))
        .route("/api/launch", post(handlers::launch))
        .route("/api/launch/:hpc/:ide/stream", get(handlers::launch_stream))
        .route("/api/switch/:hpc/:ide", post(handlers::switch))
        .route("/api/stop/:hpc/:ide", post(handlers::stop))
        .route("/api/stop/:hpc/:ide/stream", get(handlers::stop_stream))
        .route("/api/stop-all/:hpc", post(handlers::stop_all))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Delay between a cancel and the next non-streaming status refetch, spec §4.4: "After
/// cancellation the caller waits ≈1s before refetching, to let SLURM propagate the state
/// change."
pub(crate) const SLURM_PROPAGATION_DELAY: Duration = Duration::from_secs(1);
