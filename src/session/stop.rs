// Stop flow, spec §4.5 "Stop flow" / "Batch stop" / "Stale detection". Tearing down the tunnel
// is unconditional; cancelling the SLURM job is opt-in per the `cancelJob` request flag.

use tracing::warn;

use crate::error::Result;
use crate::ssh::Identity;

use super::{EndReason, SessionKey, SessionManager};

pub struct StopOutcome {
    pub job_cancelled: bool,
}

/// Stop a single session. Consults the queue for a jobId if the session doesn't carry one (it
/// may have been adopted from an already-running job this process never submitted itself).
pub async fn stop(
    manager: &SessionManager,
    key: &SessionKey,
    identity: &Identity,
    cancel_job: bool,
) -> Result<StopOutcome> {
    manager.tunnels.stop(key).await;

    let mut job_cancelled = false;
    if cancel_job {
        let session = manager.get(key);
        let job_id = match session.as_ref().and_then(|s| s.job_id.clone()) {
            Some(id) => Some(id),
            None => manager
                .job_controller
                .get_job_info(&key.cluster, identity, &key.user, key.ide)
                .await?
                .map(|j| j.job_id),
        };
        if let Some(job_id) = job_id {
            match manager.job_controller.cancel_job(&key.cluster, identity, &job_id).await {
                Ok(()) => job_cancelled = true,
                Err(e) => warn!(cluster = %key.cluster, ide = %key.ide, job_id, error = %e, "scancel failed"),
            }
        }
    }

    manager.clear(key, EndReason::Cancelled);
    if job_cancelled {
        manager.status_cache.invalidate(&key.cluster);
    }
    Ok(StopOutcome { job_cancelled })
}

pub struct BatchStopOutcome {
    pub cancelled: Vec<String>,
    pub failed: Vec<String>,
}

/// Batch stop, spec §4.5: collect every running/pending jobId for `user` on `cluster`, cancel
/// them in a single `scancel` call, and clear only the sessions whose jobId made it into the
/// successful set.
pub async fn stop_all(
    manager: &SessionManager,
    user: &str,
    cluster: &str,
    identity: &Identity,
) -> Result<BatchStopOutcome> {
    let sessions = manager.get_all_for_user(user);
    let mut by_job_id = std::collections::HashMap::new();
    for (key, session) in sessions {
        if key.cluster != cluster {
            continue;
        }
        if let Some(job_id) = session.job_id {
            by_job_id.insert(job_id, key);
        }
    }

    let job_ids: Vec<String> = by_job_id.keys().cloned().collect();
    let (cancelled, failed) = manager
        .job_controller
        .cancel_jobs(cluster, identity, &job_ids)
        .await?;

    for job_id in &cancelled {
        if let Some(key) = by_job_id.get(job_id) {
            manager.tunnels.stop(key).await;
            manager.clear(key, EndReason::Cancelled);
        }
    }
    if !cancelled.is_empty() {
        manager.status_cache.invalidate(cluster);
    }

    Ok(BatchStopOutcome { cancelled, failed })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::jobs::{Ide, JobRecord, JobState};
    use crate::session::SessionStatus;
    use crate::testutil::{test_identity, test_key, test_session_manager, MockJobController};

    use super::*;

    #[tokio::test]
    async fn stop_without_cancel_job_tears_down_tunnel_and_clears_session() {
        let job_controller = Arc::new(MockJobController::default());
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let key = test_key(Ide::Vscode);
        manager.tunnels.seed_test_handle(key.clone(), Ide::Vscode.local_port());
        manager.update(&key, |s| {
            s.status = SessionStatus::Running;
            s.job_id = Some("1".to_string());
        });

        let outcome = stop(&manager, &key, &test_identity(), false).await.expect("stop succeeds");
        assert!(!outcome.job_cancelled);
        assert!(manager.tunnels.get(&key).is_none());
        let session = manager.get(&key).expect("cleared session still present");
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.end_reason, Some(EndReason::Cancelled));
    }

    #[tokio::test]
    async fn stop_with_cancel_job_uses_the_recorded_job_id() {
        let job_controller = Arc::new(MockJobController::default());
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let key = test_key(Ide::Rstudio);
        manager.update(&key, |s| {
            s.status = SessionStatus::Running;
            s.job_id = Some("42".to_string());
        });

        let outcome = stop(&manager, &key, &test_identity(), true).await.expect("stop succeeds");
        assert!(outcome.job_cancelled);
    }

    #[tokio::test]
    async fn stop_with_cancel_job_falls_back_to_a_queue_lookup_for_an_adopted_job() {
        let job_controller = Arc::new(MockJobController::default());
        job_controller.jobs.lock().unwrap().insert(
            ("testcluster".to_string(), Ide::Jupyter),
            JobRecord {
                job_id: "7".to_string(),
                ide: Ide::Jupyter,
                state: JobState::Running,
                node: Some("c1-2".to_string()),
                time_left: None,
                time_limit: None,
                cpus: None,
                memory: None,
                start_time: None,
            },
        );
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let key = test_key(Ide::Jupyter);
        // No job_id recorded on the session: it must be looked up in the queue.
        manager.update(&key, |s| s.status = SessionStatus::Running);

        let outcome = stop(&manager, &key, &test_identity(), true).await.expect("stop succeeds");
        assert!(outcome.job_cancelled);
    }

    #[tokio::test]
    async fn stop_with_cancel_job_reports_scancel_failure_without_erroring() {
        let job_controller = Arc::new(MockJobController::default());
        *job_controller.cancel_should_fail.lock().unwrap() = true;
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let key = test_key(Ide::Vscode);
        manager.update(&key, |s| {
            s.status = SessionStatus::Running;
            s.job_id = Some("1".to_string());
        });

        let outcome = stop(&manager, &key, &test_identity(), true).await.expect("stop still succeeds");
        assert!(!outcome.job_cancelled);
        let session = manager.get(&key).expect("session cleared regardless");
        assert_eq!(session.status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn batch_stop_clears_only_sessions_whose_job_id_was_cancelled() {
        let job_controller = Arc::new(MockJobController::default());
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let vscode_key = test_key(Ide::Vscode);
        let jupyter_key = test_key(Ide::Jupyter);
        manager.tunnels.seed_test_handle(vscode_key.clone(), Ide::Vscode.local_port());
        manager.update(&vscode_key, |s| {
            s.status = SessionStatus::Running;
            s.job_id = Some("1".to_string());
        });
        manager.update(&jupyter_key, |s| {
            s.status = SessionStatus::Running;
            s.job_id = Some("2".to_string());
        });

        let outcome = stop_all(&manager, "alice", "testcluster", &test_identity())
            .await
            .expect("batch stop succeeds");
        assert_eq!(outcome.cancelled.len(), 2);
        assert!(outcome.failed.is_empty());
        assert!(manager.tunnels.get(&vscode_key).is_none());
        assert_eq!(manager.get(&vscode_key).unwrap().status, SessionStatus::Idle);
        assert_eq!(manager.get(&jupyter_key).unwrap().status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn batch_stop_ignores_sessions_on_other_clusters() {
        let job_controller = Arc::new(MockJobController::default());
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let other_cluster_key = SessionKey {
            user: "alice".to_string(),
            cluster: "othercluster".to_string(),
            ide: Ide::Vscode,
        };
        manager.update(&other_cluster_key, |s| {
            s.status = SessionStatus::Running;
            s.job_id = Some("9".to_string());
        });

        let outcome = stop_all(&manager, "alice", "testcluster", &test_identity())
            .await
            .expect("batch stop succeeds");
        assert!(outcome.cancelled.is_empty());
        assert_eq!(manager.get(&other_cluster_key).unwrap().status, SessionStatus::Running);
    }
}
