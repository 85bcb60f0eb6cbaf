// POST /switch/:hpc/:ide, spec §6: set the active session and (re)ensure its tunnel. Unlike
// launch, switch never submits or adopts a job.  It only operates on a session that is already
// `running`.

use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};
use crate::ssh::Identity;

use super::launch::ensure_tunnel;
use super::{SessionKey, SessionManager, SessionStatus};

pub async fn switch(
    manager: &SessionManager,
    key: &SessionKey,
    identity: &Identity,
    cluster_host: &str,
) -> Result<()> {
    let session = manager
        .get(key)
        .filter(|s| s.status == SessionStatus::Running)
        .ok_or_else(|| GatewayError::Validation("no running session for this ide".to_string()))?;
    let node = session
        .compute_node
        .ok_or_else(|| GatewayError::Internal("running session missing compute node".to_string()))?;

    // /switch has no SSE variant to cancel from; this token is never triggered.
    ensure_tunnel(manager, key, identity, cluster_host, &node, &CancellationToken::new()).await?;
    manager.set_active_session(&key.user, key.clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::error::GatewayError;
    use crate::jobs::Ide;
    use crate::testutil::{test_identity, test_key, test_session_manager, MockJobController};

    use super::*;

    #[tokio::test]
    async fn switch_reuses_the_existing_tunnel_and_sets_active_session() {
        let job_controller = Arc::new(MockJobController::default());
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let key = test_key(Ide::Vscode);
        manager.tunnels.seed_test_handle(key.clone(), Ide::Vscode.local_port());
        manager.update(&key, |s| {
            s.status = SessionStatus::Running;
            s.compute_node = Some("c1-1".to_string());
        });

        switch(&manager, &key, &test_identity(), "testcluster.example.org")
            .await
            .expect("switch succeeds");
        assert_eq!(manager.get_active_session("alice"), Some(key));
    }

    #[tokio::test]
    async fn switch_rejects_a_session_that_is_not_running() {
        let job_controller = Arc::new(MockJobController::default());
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let key = test_key(Ide::Jupyter);

        let result = switch(&manager, &key, &test_identity(), "testcluster.example.org").await;
        assert!(matches!(result, Err(GatewayError::Validation(_))));
    }

    #[tokio::test]
    async fn switch_rejects_a_running_session_missing_its_compute_node() {
        let job_controller = Arc::new(MockJobController::default());
        let (manager, _exited_rx) = test_session_manager(job_controller);
        let key = test_key(Ide::Rstudio);
        manager.update(&key, |s| s.status = SessionStatus::Running);

        let result = switch(&manager, &key, &test_identity(), "testcluster.example.org").await;
        assert!(matches!(result, Err(GatewayError::Internal(_))));
    }
}
