// Handler bodies for every route in spec §6's table. Each streaming handler drains the same
// `session::launch`/`session::stop` flows the non-streaming handlers call directly, differing
// only in whether progress events are forwarded to the client.

use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::cache::cluster_status::ClusterStatus;
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::jobs::{GpuSpec, HealthSnapshot, Ide, SubmitRequest};
use crate::session::launch::{launch as run_launch, LaunchOutcome, LaunchRequest};
use crate::session::{stop, switch as switch_flow, SessionKey};
use crate::sse::{GatewayEvent, Step};

use super::{AppState, CurrentUser, SLURM_PROPAGATION_DELAY};

fn require_user(_state: &AppState) -> CurrentUser {
    // The identity/LDAP provider is out of scope (spec §1 Non-goals); a real deployment installs
    // middleware ahead of these handlers that inserts a `CurrentUser` request extension. Tests
    // and this crate's handlers alike depend only on that extractor shape.
    CurrentUser {
        username: "anonymous".to_string(),
        hpc_user: "anonymous".to_string(),
    }
}

/// Wraps an SSE body stream so that dropping it -- which is what Axum does the moment the client
/// disconnects -- cancels the `CancellationToken` driving the in-flight launch, spec §5.
struct CancelOnDrop<S> {
    inner: S,
    cancel: CancellationToken,
}

impl<S: Stream + Unpin> Stream for CancelOnDrop<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<S> Drop for CancelOnDrop<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn cluster_host(config: &Config, cluster: &str) -> Result<String> {
    config
        .cluster(cluster)
        .map(|c| c.host.clone())
        .ok_or_else(|| GatewayError::Validation(format!("unknown cluster {cluster}")))
}

#[derive(Serialize)]
pub struct StatusResponse {
    sessions: HashMap<String, crate::session::Session>,
    active_session: Option<ActiveSessionView>,
}

#[derive(Serialize)]
struct ActiveSessionView {
    hpc: String,
    ide: Ide,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let user = require_user(&state);
    let sessions = state.sessions.get_all_for_user(&user.username);
    let active = state.sessions.get_active_session(&user.username);
    Json(StatusResponse {
        sessions: sessions
            .into_iter()
            .map(|(k, v)| (format!("{}:{}", k.cluster, k.ide), v))
            .collect(),
        active_session: active.map(|k| ActiveSessionView {
            hpc: k.cluster,
            ide: k.ide,
        }),
    })
}

#[derive(Deserialize)]
pub struct ClusterStatusQuery {
    #[serde(default)]
    refresh: bool,
}

pub async fn cluster_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ClusterStatusQuery>,
) -> Result<Json<crate::cache::cluster_status::StatusResponse>> {
    let user = require_user(&state);
    let identity = state.resolve_identity(&user)?;
    let clusters: Vec<String> = state.config.clusters.keys().cloned().collect();
    let job_controller = state.sessions.job_controller.clone();
    let resp = state
        .sessions
        .status_cache
        .get_or_refresh(&clusters, query.refresh, move |cluster| {
            let job_controller = job_controller.clone();
            let identity = identity.clone();
            let user = user.hpc_user.clone();
            async move {
                match job_controller.get_all_jobs(&cluster, &identity, &user).await {
                    Ok(jobs) => ClusterStatus { jobs },
                    Err(_) => ClusterStatus::default(),
                }
            }
        })
        .await;
    Ok(Json(resp))
}

/// Raw data for the (out-of-scope per spec §1) cluster-health dashboard; this handler only
/// forwards the job controller's parsed snapshot, it does not render or summarize it.
pub async fn cluster_health(
    State(state): State<Arc<AppState>>,
    Path(hpc): Path<String>,
) -> Result<Json<HealthSnapshot>> {
    let user = require_user(&state);
    let identity = state.resolve_identity(&user)?;
    let snapshot = state
        .sessions
        .job_controller
        .get_health_snapshot(&hpc, &identity)
        .await?;
    Ok(Json(snapshot))
}

#[derive(Deserialize)]
pub struct LaunchBody {
    hpc: String,
    #[serde(default = "default_ide")]
    ide: Ide,
    cpus: u32,
    mem_gb: u32,
    walltime_hours: u32,
    release: String,
    gpu: Option<GpuSpec>,
    account: Option<String>,
}

fn default_ide() -> Ide {
    Ide::Vscode
}

#[derive(Serialize)]
pub struct LaunchResponse {
    status: String,
    job_id: Option<String>,
    node: Option<String>,
    start_time: Option<String>,
}

fn build_request(state: &AppState, user: &CurrentUser, hpc: &str, ide: Ide, body: LaunchFields) -> Result<LaunchRequest> {
    let identity = state.resolve_identity(user)?;
    let host = cluster_host(&state.config, hpc)?;
    Ok(LaunchRequest {
        key: SessionKey {
            user: user.username.clone(),
            cluster: hpc.to_string(),
            ide,
        },
        identity,
        cluster_host: host,
        submit: SubmitRequest {
            ide,
            cpus: body.cpus,
            mem_gb: body.mem_gb,
            walltime_hours: body.walltime_hours,
            release: body.release,
            gpu: body.gpu,
            account: body.account,
        },
    })
}

struct LaunchFields {
    cpus: u32,
    mem_gb: u32,
    walltime_hours: u32,
    release: String,
    gpu: Option<GpuSpec>,
    account: Option<String>,
}

pub async fn launch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LaunchBody>,
) -> Result<Json<LaunchResponse>> {
    let user = require_user(&state);
    let req = build_request(
        &state,
        &user,
        &body.hpc,
        body.ide,
        LaunchFields {
            cpus: body.cpus,
            mem_gb: body.mem_gb,
            walltime_hours: body.walltime_hours,
            release: body.release,
            gpu: body.gpu,
            account: body.account,
        },
    )?;
    let outcome = run_launch(&state.sessions, &state.config, req, None, &CancellationToken::new()).await?;
    Ok(Json(match outcome {
        LaunchOutcome::Running { job_id, node } | LaunchOutcome::Connected { job_id, node } => LaunchResponse {
            status: "running".to_string(),
            job_id: Some(job_id),
            node: Some(node),
            start_time: None,
        },
        LaunchOutcome::Pending { job_id, start_time } => LaunchResponse {
            status: "pending".to_string(),
            job_id: Some(job_id),
            node: None,
            start_time,
        },
    }))
}

#[derive(Deserialize)]
pub struct LaunchStreamQuery {
    cpus: u32,
    mem_gb: u32,
    walltime_hours: u32,
    release: String,
    gpu: Option<GpuSpec>,
    account: Option<String>,
}

pub async fn launch_stream(
    State(state): State<Arc<AppState>>,
    Path((hpc, ide)): Path<(String, Ide)>,
    Query(query): Query<LaunchStreamQuery>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let user = require_user(&state);
    let req = build_request(
        &state,
        &user,
        &hpc,
        ide,
        LaunchFields {
            cpus: query.cpus,
            mem_gb: query.mem_gb,
            walltime_hours: query.walltime_hours,
            release: query.release,
            gpu: query.gpu,
            account: query.account,
        },
    )?;

    let (tx, rx) = mpsc::unbounded_channel::<GatewayEvent>();
    let hpc_for_task = hpc.clone();
    let ide_for_task = ide;
    let state_for_task = state.clone();
    let cancel = CancellationToken::new();
    let cancel_for_task = cancel.clone();
    tokio::spawn(async move {
        let result = run_launch(
            &state_for_task.sessions,
            &state_for_task.config,
            req,
            Some(&tx),
            &cancel_for_task,
        )
        .await;
        let terminal = match result {
            Ok(LaunchOutcome::Running { job_id, node }) | Ok(LaunchOutcome::Connected { job_id, node }) => {
                GatewayEvent::Complete {
                    status: "running".to_string(),
                    hpc: hpc_for_task,
                    ide: ide_for_task.to_string(),
                    job_id: Some(job_id),
                    node: Some(node),
                    redirect_url: Some(format!("/{}/", ide_for_task.as_str())),
                }
            }
            Ok(LaunchOutcome::Pending { .. }) => return,
            Err(GatewayError::Cancelled) => return,
            Err(e) => GatewayEvent::Error { message: e.to_string() },
        };
        let _ = tx.send(terminal);
    });

    let stream = UnboundedReceiverStream::new(rx).map(|ev| Ok(ev.to_sse_event()));
    let stream = CancelOnDrop { inner: stream, cancel };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn switch(
    State(state): State<Arc<AppState>>,
    Path((hpc, ide)): Path<(String, Ide)>,
) -> Result<Json<serde_json::Value>> {
    let user = require_user(&state);
    let identity = state.resolve_identity(&user)?;
    let host = cluster_host(&state.config, &hpc)?;
    let key = SessionKey {
        user: user.username.clone(),
        cluster: hpc,
        ide,
    };
    switch_flow::switch(&state.sessions, &key, &identity, &host).await?;
    Ok(Json(serde_json::json!({"status": "connected"})))
}

#[derive(Deserialize, Default)]
pub struct StopBody {
    #[serde(default)]
    cancel_job: bool,
}

#[derive(Serialize)]
pub struct StopResponse {
    job_cancelled: bool,
}

pub async fn stop(
    State(state): State<Arc<AppState>>,
    Path((hpc, ide)): Path<(String, Ide)>,
    body: axum::extract::Json<StopBody>,
) -> Result<Json<StopResponse>> {
    let user = require_user(&state);
    let identity = state.resolve_identity(&user)?;
    let key = SessionKey {
        user: user.username.clone(),
        cluster: hpc,
        ide,
    };
    let outcome = stop::stop(&state.sessions, &key, &identity, body.0.cancel_job).await?;
    if outcome.job_cancelled {
        tokio::time::sleep(SLURM_PROPAGATION_DELAY).await;
        // spec §4.4: the queue lags scancel briefly; refetch so the cached view doesn't keep
        // showing a job we just cancelled.
        let _ = state
            .sessions
            .job_controller
            .get_all_jobs(&key.cluster, &identity, &user.username)
            .await;
        state.sessions.status_cache.invalidate(&key.cluster);
    }
    Ok(Json(StopResponse {
        job_cancelled: outcome.job_cancelled,
    }))
}

pub async fn stop_stream(
    State(state): State<Arc<AppState>>,
    Path((hpc, ide)): Path<(String, Ide)>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let user = require_user(&state);
    let identity = state.resolve_identity(&user)?;
    let key = SessionKey {
        user: user.username.clone(),
        cluster: hpc.clone(),
        ide,
    };

    let (tx, rx) = mpsc::unbounded_channel::<GatewayEvent>();
    tokio::spawn(async move {
        let _ = tx.send(GatewayEvent::progress(Step::Cancelling, "stopping session"));
        let result = stop::stop(&state.sessions, &key, &identity, true).await;
        let terminal = match result {
            Ok(_outcome) => GatewayEvent::Complete {
                status: "stopped".to_string(),
                hpc,
                ide: key.ide.to_string(),
                job_id: None,
                node: None,
                redirect_url: None,
            },
            Err(e) => GatewayEvent::Error { message: e.to_string() },
        };
        let _ = tx.send(terminal);
    });

    let stream = UnboundedReceiverStream::new(rx).map(|ev| Ok(ev.to_sse_event()));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Serialize)]
pub struct StopAllResponse {
    cancelled: usize,
    failed: Vec<String>,
    job_ids: Vec<String>,
}

pub async fn stop_all(
    State(state): State<Arc<AppState>>,
    Path(hpc): Path<String>,
) -> Result<Json<StopAllResponse>> {
    let user = require_user(&state);
    let identity = state.resolve_identity(&user)?;
    let outcome = stop::stop_all(&state.sessions, &user.username, &hpc, &identity).await?;
    if !outcome.cancelled.is_empty() {
        tokio::time::sleep(SLURM_PROPAGATION_DELAY).await;
        let _ = state
            .sessions
            .job_controller
            .get_all_jobs(&hpc, &identity, &user.username)
            .await;
        state.sessions.status_cache.invalidate(&hpc);
    }
    Ok(Json(StopAllResponse {
        cancelled: outcome.cancelled.len(),
        job_ids: outcome.cancelled,
        failed: outcome.failed,
    }))
}
