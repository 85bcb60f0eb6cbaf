use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

use hpc_ide_gateway::auth::{SessionKeyStore, UserStore};
use hpc_ide_gateway::config::Config;
use hpc_ide_gateway::http::{router, AppState};
use hpc_ide_gateway::jobs::{JobController, RealJobController};
use hpc_ide_gateway::ssh::{RealTransport, Transport};
use hpc_ide_gateway::analytics;
use hpc_ide_gateway::tunnel::TunnelManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::load()?;
    info!(clusters = config.clusters.len(), "loaded configuration");

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&format!("sqlite://{}?mode=rwc", config.db_path))
        .await?;
    sqlx::migrate!().run(&pool).await?;

    let cluster_hosts = config
        .clusters
        .iter()
        .map(|(name, cfg)| (name.clone(), cfg.host.clone()))
        .collect();

    let transport: Arc<dyn Transport> = Arc::new(RealTransport::new());
    let job_controller: Arc<dyn JobController> = Arc::new(RealJobController::new(transport, cluster_hosts));
    let (tunnels, tunnel_exits) = TunnelManager::new();
    tunnels.reap_orphans().await;

    let users = Arc::new(UserStore::new(pool.clone()));
    let keys = Arc::new(SessionKeyStore::new(config.session_key_ttl));
    keys.spawn_sweeper();

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, job_controller, tunnels, tunnel_exits, users, keys);

    analytics::spawn_session_event_sink(pool, &state.sessions);

    // The background poller that keeps the status cache warm independent of foreground reads
    // (spec §4.4) needs a standing, per-cluster admin identity to run `squeue` on no one's
    // behalf in particular; that identity is supplied by the (out-of-scope, spec §1) deployment
    // environment. This crate's contribution is the cache itself and its on-demand
    // refresh-stale-in-parallel policy in `ClusterStatusCache::get_or_refresh`, exercised by
    // every `GET /api/cluster-status` call.

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
