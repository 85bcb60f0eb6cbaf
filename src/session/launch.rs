// Canonical launch flow, spec §4.5 steps 1-10. Emits progress events to `tx` as it goes; the
// non-streaming `/launch` handler drains the same flow and only keeps the terminal event.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::cluster_status::ClusterStatusCache;
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::jobs::{JobController, SubmitRequest, WaitOutcome};
use crate::ssh::Identity;
use crate::sse::{GatewayEvent, Step};

use super::{EndReason, SessionKey, SessionManager, SessionStatus};

const SHORT_CHECK_ATTEMPTS: u32 = 2;

pub struct LaunchRequest {
    pub key: SessionKey,
    pub identity: Identity,
    pub cluster_host: String,
    pub submit: SubmitRequest,
}

pub enum LaunchOutcome {
    Connected { job_id: String, node: String },
    Running { job_id: String, node: String },
    Pending { job_id: String, start_time: Option<String> },
}

/// Runs the canonical launch flow, spec §4.5. `cancel` carries spec §5's per-operation
/// cancellation: an SSE caller cancels it when its client disconnects (`http::launch_stream`);
/// non-streaming callers pass a token that is never cancelled. Per spec §5 "Cancellation
/// semantics", a cancellation mid-flight abandons the in-flight SSH/tunnel call, kills a
/// half-established tunnel, releases the launch lock (via `_guard`'s `Drop`), and leaves the
/// session in whatever state it last persisted -- it is not reset or cleared.
pub async fn launch(
    manager: &SessionManager,
    config: &Config,
    req: LaunchRequest,
    tx: Option<&UnboundedSender<GatewayEvent>>,
    cancel: &CancellationToken,
) -> Result<LaunchOutcome> {
    let emit = |ev: GatewayEvent| {
        if let Some(tx) = tx {
            let _ = tx.send(ev);
        }
    };

    // Step 1: validation.
    let cluster_cfg = config
        .cluster(&req.key.cluster)
        .ok_or_else(|| GatewayError::Validation(format!("unknown cluster {}", req.key.cluster)))?;
    if !cluster_cfg.releases.iter().any(|r| r == &req.submit.release) {
        return Err(GatewayError::Validation(format!(
            "release {} is not available on {}",
            req.submit.release, req.key.cluster
        )));
    }
    if !cluster_cfg.ide_allowed_for_release(&req.submit.release, req.submit.ide) {
        return Err(GatewayError::Validation(format!(
            "{} is not available in release {}",
            req.submit.ide, req.submit.release
        )));
    }
    if let Some(gpu) = &req.submit.gpu {
        if !cluster_cfg.gpu_types.iter().any(|t| t == &gpu.gres) {
            return Err(GatewayError::Validation(format!(
                "gpu type {} is not available on {}",
                gpu.gres, req.key.cluster
            )));
        }
    }
    if req.submit.cpus > cluster_cfg.max_cpus
        || req.submit.mem_gb > cluster_cfg.max_mem_gb
        || req.submit.walltime_hours > cluster_cfg.max_walltime_hours
    {
        return Err(GatewayError::Validation(
            "requested resources exceed partition limits".to_string(),
        ));
    }

    // Step 2: acquire the per-key launch lock. No queuing: contention is an immediate failure.
    let _guard = manager
        .acquire_lock(&SessionManager::launch_lock_name(&req.key))
        .ok_or(GatewayError::Busy)?;

    emit(GatewayEvent::progress(Step::Connecting, "connecting to cluster"));

    // Step 3: reconnect path for an already-running session.
    let existing = manager.get_or_create(&req.key);
    if existing.status == SessionStatus::Running {
        emit(GatewayEvent::progress(Step::Verifying, "verifying existing job"));
        let live = tokio::select! {
            result = manager
                .job_controller
                .get_job_info(&req.key.cluster, &req.identity, &req.key.user, req.key.ide) => result?,
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };
        let still_live = match (&existing.job_id, &live) {
            (Some(expected), Some(job)) => &job.job_id == expected,
            _ => false,
        };
        if still_live {
            let node = existing.compute_node.clone().ok_or_else(|| {
                GatewayError::Internal("running session missing compute node".to_string())
            })?;
            ensure_tunnel(manager, &req.key, &req.identity, &req.cluster_host, &node, cancel).await?;
            manager.set_active_session(&req.key.user, req.key.clone());
            emit(GatewayEvent::progress(Step::Connecting, "reconnected"));
            return Ok(LaunchOutcome::Connected {
                job_id: existing.job_id.clone().unwrap(),
                node,
            });
        }
        // Stale: the job vanished from the queue since we last recorded it running.
        manager.clear(&req.key, EndReason::Timeout);
        emit(GatewayEvent::progress(Step::Launching, "previous job ended, starting a new one"));
    } else if matches!(existing.status, SessionStatus::Starting | SessionStatus::Pending) {
        return Err(GatewayError::InProgress);
    }

    // Steps 6-7: transition to starting, reuse or submit a job.
    manager.update(&req.key, |s| {
        s.status = SessionStatus::Starting;
        s.cpus = Some(req.submit.cpus);
        s.memory_gb = Some(req.submit.mem_gb);
        s.walltime_hours = Some(req.submit.walltime_hours);
    });

    emit(GatewayEvent::progress(Step::Submitting, "checking queue for an existing job"));
    let all_jobs = tokio::select! {
        result = manager
            .job_controller
            .get_all_jobs(&req.key.cluster, &req.identity, &req.key.user) => match result {
            Ok(jobs) => jobs,
            Err(e) => {
                manager.reset_idle_with_error(&req.key, e.to_string());
                return Err(e);
            }
        },
        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
    };

    let job_id = if let Some(job) = all_jobs.get(&req.key.ide) {
        info!(cluster = %req.key.cluster, ide = %req.key.ide, job_id = %job.job_id, "adopting existing queued job");
        job.job_id.clone()
    } else {
        let result = tokio::select! {
            result = manager
                .job_controller
                .submit_job(&req.key.cluster, &req.identity, &req.key.user, &req.submit) => match result {
                Ok(result) => result,
                Err(_) => {
                    let err = GatewayError::Submit("sbatch did not return a job id".to_string());
                    manager.reset_idle_with_error(&req.key, err.to_string());
                    return Err(err);
                }
            },
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };
        manager.update(&req.key, |s| {
            s.submitted_at = Some(crate::time::now());
            s.release_version = Some(req.submit.release.clone());
            s.gpu = req.submit.gpu.clone();
            s.account = req.submit.account.clone();
            s.auth_token = result.token.clone();
        });
        result.job_id
    };
    emit(GatewayEvent::progress(Step::Submitted, format!("job {job_id} submitted")));

    // Step 8: short status check.
    emit(GatewayEvent::progress(Step::Waiting, "waiting for node assignment"));
    let outcome = tokio::select! {
        result = manager
            .job_controller
            .wait_for_node(
                &req.key.cluster,
                &req.identity,
                &req.key.user,
                req.key.ide,
                &job_id,
                SHORT_CHECK_ATTEMPTS,
                true,
            ) => match result {
            Ok(outcome) => outcome,
            Err(GatewayError::JobGone) => {
                manager.clear(&req.key, EndReason::Timeout);
                return Err(GatewayError::JobGone);
            }
            Err(e) => {
                manager.reset_idle_with_error(&req.key, e.to_string());
                return Err(e);
            }
        },
        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
    };

    let (node, job_id) = match outcome {
        WaitOutcome::Node { node } => (node, job_id),
        WaitOutcome::Pending { job_id, start_time } => {
            manager.update(&req.key, |s| {
                s.status = SessionStatus::Pending;
                s.job_id = Some(job_id.clone());
                s.estimated_start_time = start_time.clone();
            });
            emit(GatewayEvent::Pending {
                job_id: job_id.clone(),
                start_time: start_time.clone(),
                message: "job is still pending, reconnect later".to_string(),
            });
            return Ok(LaunchOutcome::Pending { job_id, start_time });
        }
    };

    // Steps 9-10: establish the tunnel, transition to running.
    emit(GatewayEvent::progress(Step::Starting, format!("node {node} assigned")));
    emit(GatewayEvent::progress(Step::Establishing, "establishing tunnel"));
    if let Err(e) = ensure_tunnel(manager, &req.key, &req.identity, &req.cluster_host, &node, cancel).await {
        manager.reset_idle_with_error(&req.key, e.to_string());
        return Err(e);
    }

    manager.update(&req.key, |s| {
        s.status = SessionStatus::Running;
        s.job_id = Some(job_id.clone());
        s.compute_node = Some(node.clone());
        s.started_at = Some(crate::time::now());
        s.error = None;
    });
    manager.set_active_session(&req.key.user, req.key.clone());
    manager.status_cache.invalidate(&req.key.cluster);

    Ok(LaunchOutcome::Running { job_id, node })
}

/// Starts a tunnel for `key` if one isn't already recorded; a no-op on the reconnect/switch
/// paths where a tunnel from an earlier launch is still alive. `cancel` is raced against both
/// the port lookup and the tunnel establishment itself, spec §5.
pub(crate) async fn ensure_tunnel(
    manager: &SessionManager,
    key: &SessionKey,
    identity: &Identity,
    cluster_host: &str,
    node: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    if manager.tunnels.get(key).is_some() {
        return Ok(());
    }
    let remote_port = tokio::select! {
        result = manager
            .job_controller
            .get_ide_port(&key.cluster, identity, &key.user, key.ide) => result?,
        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
    };
    manager
        .tunnels
        .start(key.clone(), identity, cluster_host, node, remote_port, cancel)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::error::GatewayError;
    use crate::jobs::{Ide, JobRecord, JobState, WaitOutcome};
    use crate::testutil::{
        test_config, test_identity, test_key, test_session_manager, MockJobController, ScriptedFailure,
    };

    use super::*;

    fn submit_request(ide: Ide) -> SubmitRequest {
        SubmitRequest {
            ide,
            cpus: 4,
            mem_gb: 16,
            walltime_hours: 4,
            release: "3.20".to_string(),
            gpu: None,
            account: None,
        }
    }

    fn launch_request(key: SessionKey) -> LaunchRequest {
        LaunchRequest {
            cluster_host: "testcluster.example.org".to_string(),
            submit: submit_request(key.ide),
            identity: test_identity(),
            key,
        }
    }

    #[tokio::test]
    async fn cold_launch_reaches_running_and_records_the_tunnel() {
        let job_controller = Arc::new(MockJobController::default());
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let config = test_config();
        let key = test_key(Ide::Vscode);
        manager.tunnels.seed_test_handle(key.clone(), Ide::Vscode.local_port());

        let outcome = launch(&manager, &config, launch_request(key.clone()), None, &CancellationToken::new())
            .await
            .expect("cold launch succeeds");
        match outcome {
            LaunchOutcome::Running { job_id, node } => {
                assert_eq!(job_id, "1");
                assert_eq!(node, "c1-1");
            }
            _ => panic!("expected Running"),
        }
        let session = manager.get(&key).expect("session recorded");
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.job_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn cold_launch_records_auth_token_for_vscode() {
        let job_controller = Arc::new(MockJobController::default());
        *job_controller.submit_token.lock().unwrap() = Some("tok-abc".to_string());
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let config = test_config();
        let key = test_key(Ide::Vscode);
        manager.tunnels.seed_test_handle(key.clone(), Ide::Vscode.local_port());

        launch(&manager, &config, launch_request(key.clone()), None, &CancellationToken::new())
            .await
            .expect("launch succeeds");
        let session = manager.get(&key).expect("session recorded");
        assert_eq!(session.auth_token.as_deref(), Some("tok-abc"));
    }

    #[tokio::test]
    async fn job_still_pending_returns_pending_outcome() {
        let job_controller = Arc::new(MockJobController::default());
        job_controller
            .wait_outcomes
            .lock()
            .unwrap()
            .push(WaitOutcome::Pending {
                job_id: String::new(),
                start_time: Some("2026-08-01T10:00:00".to_string()),
            });
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let config = test_config();
        let key = test_key(Ide::Rstudio);

        let outcome = launch(&manager, &config, launch_request(key.clone()), None, &CancellationToken::new())
            .await
            .expect("launch succeeds");
        match outcome {
            LaunchOutcome::Pending { job_id, start_time } => {
                assert_eq!(job_id, "1");
                assert_eq!(start_time.as_deref(), Some("2026-08-01T10:00:00"));
            }
            _ => panic!("expected Pending"),
        }
        let session = manager.get(&key).expect("session recorded");
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(
            session.estimated_start_time.as_deref(),
            Some("2026-08-01T10:00:00")
        );
    }

    #[tokio::test]
    async fn reconnect_to_a_running_session_is_idempotent() {
        let job_controller = Arc::new(MockJobController::default());
        let (manager, _exited_rx) = test_session_manager(job_controller.clone());
        let config = test_config();
        let key = test_key(Ide::Vscode);
        manager.tunnels.seed_test_handle(key.clone(), Ide::Vscode.local_port());

        launch(&manager, &config, launch_request(key.clone()), None, &CancellationToken::new())
            .await
            .expect("first launch succeeds");

        // Put the adopted job id back into the queue so the reconnect's liveness check passes.
        job_controller.jobs.lock().unwrap().insert(
            ("testcluster".to_string(), Ide::Vscode),
            JobRecord {
                job_id: "1".to_string(),
                ide: Ide::Vscode,
                state: JobState::Running,
                node: Some("c1-1".to_string()),
                time_left: None,
                time_limit: None,
                cpus: None,
                memory: None,
                start_time: None,
            },
        );

        let outcome = launch(&manager, &config, launch_request(key.clone()), None, &CancellationToken::new())
            .await
            .expect("reconnect succeeds");
        match outcome {
            LaunchOutcome::Connected { job_id, node } => {
                assert_eq!(job_id, "1");
                assert_eq!(node, "c1-1");
            }
            _ => panic!("expected Connected"),
        }
    }

    #[tokio::test]
    async fn stale_running_session_is_cleared_and_relaunched() {
        let job_controller = Arc::new(MockJobController::default());
        *job_controller.submit_job_id.lock().unwrap() = Some("2".to_string());
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let config = test_config();
        let key = test_key(Ide::Jupyter);
        manager.tunnels.seed_test_handle(key.clone(), Ide::Jupyter.local_port());

        manager.update(&key, |s| {
            s.status = SessionStatus::Running;
            s.job_id = Some("99".to_string());
            s.compute_node = Some("c1-9".to_string());
        });

        let outcome = launch(&manager, &config, launch_request(key.clone()), None, &CancellationToken::new())
            .await
            .expect("relaunch succeeds");
        match outcome {
            LaunchOutcome::Running { job_id, .. } => assert_eq!(job_id, "2"),
            _ => panic!("expected Running"),
        }
    }

    #[tokio::test]
    async fn launch_rejects_a_release_not_available_on_the_cluster() {
        let job_controller = Arc::new(MockJobController::default());
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let config = test_config();
        let key = test_key(Ide::Vscode);
        let mut req = launch_request(key);
        req.submit.release = "1.00".to_string();

        let result = launch(&manager, &config, req, None, &CancellationToken::new()).await;
        assert!(matches!(result, Err(GatewayError::Validation(_))));
    }

    #[tokio::test]
    async fn launch_rejects_a_gpu_type_not_available_on_the_cluster() {
        let job_controller = Arc::new(MockJobController::default());
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let config = test_config();
        let key = test_key(Ide::Vscode);
        let mut req = launch_request(key);
        req.submit.gpu = Some(crate::jobs::GpuSpec {
            gres: "h100".to_string(),
            count: 1,
        });

        let result = launch(&manager, &config, req, None, &CancellationToken::new()).await;
        assert!(matches!(result, Err(GatewayError::Validation(_))));
    }

    #[tokio::test]
    async fn launch_rejects_an_ide_not_allowed_in_the_requested_release() {
        let job_controller = Arc::new(MockJobController::default());
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let mut config = test_config();
        config
            .clusters
            .get_mut("testcluster")
            .unwrap()
            .ide_allowlist
            .insert("3.20".to_string(), vec![Ide::Vscode]);
        let key = test_key(Ide::Rstudio);

        let result = launch(&manager, &config, launch_request(key), None, &CancellationToken::new()).await;
        assert!(matches!(result, Err(GatewayError::Validation(_))));
    }

    #[tokio::test]
    async fn get_all_jobs_failure_resets_the_session_to_idle_with_error() {
        let job_controller = Arc::new(MockJobController::default());
        *job_controller.fail_get_all_jobs.lock().unwrap() = Some(ScriptedFailure::Transport);
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let config = test_config();
        let key = test_key(Ide::Vscode);

        let result = launch(&manager, &config, launch_request(key.clone()), None, &CancellationToken::new()).await;
        assert!(matches!(result, Err(GatewayError::Transport(_))));
        let session = manager.get(&key).expect("session recorded");
        assert_eq!(session.status, SessionStatus::Idle);
        assert!(session.error.is_some());
        assert!(session.job_id.is_none());
    }

    #[tokio::test]
    async fn submit_job_failure_resets_the_session_to_idle_with_error() {
        let job_controller = Arc::new(MockJobController::default());
        *job_controller.fail_submit_job.lock().unwrap() = Some(ScriptedFailure::Transport);
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let config = test_config();
        let key = test_key(Ide::Rstudio);

        let result = launch(&manager, &config, launch_request(key.clone()), None, &CancellationToken::new()).await;
        assert!(matches!(result, Err(GatewayError::Submit(_))));
        let session = manager.get(&key).expect("session recorded");
        assert_eq!(session.status, SessionStatus::Idle);
        assert!(session.error.is_some());
    }

    #[tokio::test]
    async fn wait_for_node_job_gone_clears_the_session_with_timeout_reason() {
        let job_controller = Arc::new(MockJobController::default());
        *job_controller.fail_wait_for_node.lock().unwrap() = Some(ScriptedFailure::JobGone);
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let config = test_config();
        let key = test_key(Ide::Jupyter);

        let result = launch(&manager, &config, launch_request(key.clone()), None, &CancellationToken::new()).await;
        assert!(matches!(result, Err(GatewayError::JobGone)));
        let session = manager.get(&key).expect("session recorded");
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.end_reason, Some(EndReason::Timeout));
    }

    #[tokio::test]
    async fn wait_for_node_transport_failure_resets_the_session_to_idle_with_error() {
        let job_controller = Arc::new(MockJobController::default());
        *job_controller.fail_wait_for_node.lock().unwrap() = Some(ScriptedFailure::Transport);
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let config = test_config();
        let key = test_key(Ide::Vscode);

        let result = launch(&manager, &config, launch_request(key.clone()), None, &CancellationToken::new()).await;
        assert!(matches!(result, Err(GatewayError::Transport(_))));
        let session = manager.get(&key).expect("session recorded");
        assert_eq!(session.status, SessionStatus::Idle);
        assert!(session.error.is_some());
    }

    #[tokio::test]
    async fn tunnel_establishment_failure_leaves_the_session_idle_with_error() {
        let job_controller = Arc::new(MockJobController::default());
        *job_controller.fail_get_ide_port.lock().unwrap() = Some(ScriptedFailure::Transport);
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let config = test_config();
        let key = test_key(Ide::Vscode);

        let result = launch(&manager, &config, launch_request(key.clone()), None, &CancellationToken::new()).await;
        assert!(matches!(result, Err(GatewayError::Transport(_))));
        let session = manager.get(&key).expect("session recorded");
        assert_eq!(session.status, SessionStatus::Idle);
        assert!(session.error.is_some());
        assert!(manager.tunnels.get(&key).is_none());
    }

    #[tokio::test]
    async fn concurrent_launch_on_the_same_key_is_busy() {
        let job_controller = Arc::new(MockJobController::default());
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let config = test_config();
        let key = test_key(Ide::Vscode);

        let _guard = manager
            .acquire_lock(&SessionManager::launch_lock_name(&key))
            .expect("lock acquired");

        let result = launch(&manager, &config, launch_request(key), None, &CancellationToken::new()).await;
        assert!(matches!(result, Err(GatewayError::Busy)));
    }

    #[tokio::test]
    async fn launch_while_already_starting_is_in_progress() {
        let job_controller = Arc::new(MockJobController::default());
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let config = test_config();
        let key = test_key(Ide::Vscode);
        manager.update(&key, |s| s.status = SessionStatus::Starting);

        let result = launch(&manager, &config, launch_request(key), None, &CancellationToken::new()).await;
        assert!(matches!(result, Err(GatewayError::InProgress)));
    }
}
