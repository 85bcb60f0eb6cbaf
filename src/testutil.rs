// Trait-based fakes for every external-system boundary this crate defines, mirroring the
// teacher's `mocksystem.rs`/`mockjobs.rs` pattern: a `Mutex`-guarded scripted response queue the
// test configures up front, so the state machine and HTTP handlers can be exercised without a
// real cluster, SSH binary, or SLURM installation.

#![cfg(test)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::cluster_status::ClusterStatusCache;
use crate::config::{ClusterConfig, Config};
use crate::error::Result;
use crate::jobs::{HealthSnapshot, JobController, JobRecord, SubmitRequest, SubmitResult, WaitOutcome};
use crate::session::SessionManager;
use crate::ssh::{Identity, Transport};
use crate::tunnel::{SessionKey, TunnelManager};

pub struct MockTransport {
    pub scripted: Mutex<Vec<Result<String>>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new(scripted: Vec<Result<String>>) -> Self {
        MockTransport {
            scripted: Mutex::new(scripted),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn execute(&self, cluster: &str, _identity: &Identity, script: &str) -> Result<String> {
        self.calls.lock().unwrap().push(format!("{cluster}:{script}"));
        let mut scripted = self.scripted.lock().unwrap();
        if scripted.is_empty() {
            return Ok(String::new());
        }
        scripted.remove(0)
    }
}

/// A scripted failure for one of `MockJobController`'s fallible calls, used to exercise
/// `session::launch`'s error-reset paths (spec §7).
#[derive(Clone, Copy, Debug)]
pub enum ScriptedFailure {
    Transport,
    JobGone,
}

#[derive(Default)]
pub struct MockJobController {
    pub jobs: Mutex<HashMap<(String, crate::jobs::Ide), JobRecord>>,
    pub submit_job_id: Mutex<Option<String>>,
    pub submit_token: Mutex<Option<String>>,
    pub wait_outcomes: Mutex<Vec<WaitOutcome>>,
    pub ports: Mutex<HashMap<crate::jobs::Ide, u16>>,
    pub cancel_should_fail: Mutex<bool>,
    pub fail_get_all_jobs: Mutex<Option<ScriptedFailure>>,
    pub fail_submit_job: Mutex<Option<ScriptedFailure>>,
    pub fail_wait_for_node: Mutex<Option<ScriptedFailure>>,
    pub fail_get_ide_port: Mutex<Option<ScriptedFailure>>,
}

fn scripted_err(failure: ScriptedFailure) -> crate::error::GatewayError {
    match failure {
        ScriptedFailure::Transport => crate::error::GatewayError::Transport("mock transport failure".to_string()),
        ScriptedFailure::JobGone => crate::error::GatewayError::JobGone,
    }
}

#[async_trait::async_trait]
impl JobController for MockJobController {
    async fn get_job_info(
        &self,
        cluster: &str,
        _identity: &Identity,
        _user: &str,
        ide: crate::jobs::Ide,
    ) -> Result<Option<JobRecord>> {
        Ok(self.jobs.lock().unwrap().get(&(cluster.to_string(), ide)).cloned())
    }

    async fn get_all_jobs(
        &self,
        cluster: &str,
        _identity: &Identity,
        _user: &str,
    ) -> Result<HashMap<crate::jobs::Ide, JobRecord>> {
        if let Some(failure) = *self.fail_get_all_jobs.lock().unwrap() {
            return Err(scripted_err(failure));
        }
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|((c, _), _)| c == cluster)
            .map(|((_, ide), rec)| (*ide, rec.clone()))
            .collect())
    }

    async fn submit_job(
        &self,
        _cluster: &str,
        _identity: &Identity,
        _user: &str,
        _req: &SubmitRequest,
    ) -> Result<SubmitResult> {
        if let Some(failure) = *self.fail_submit_job.lock().unwrap() {
            return Err(scripted_err(failure));
        }
        let job_id = self
            .submit_job_id
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "1".to_string());
        let token = self.submit_token.lock().unwrap().clone();
        Ok(SubmitResult { job_id, token })
    }

    async fn cancel_job(&self, _cluster: &str, _identity: &Identity, _job_id: &str) -> Result<()> {
        if *self.cancel_should_fail.lock().unwrap() {
            return Err(crate::error::GatewayError::Transport("scancel failed".to_string()));
        }
        Ok(())
    }

    async fn cancel_jobs(
        &self,
        _cluster: &str,
        _identity: &Identity,
        job_ids: &[String],
    ) -> Result<(Vec<String>, Vec<String>)> {
        if *self.cancel_should_fail.lock().unwrap() {
            return Ok((vec![], job_ids.to_vec()));
        }
        Ok((job_ids.to_vec(), vec![]))
    }

    async fn wait_for_node(
        &self,
        _cluster: &str,
        _identity: &Identity,
        _user: &str,
        _ide: crate::jobs::Ide,
        job_id: &str,
        _max_attempts: u32,
        _return_pending_on_timeout: bool,
    ) -> Result<WaitOutcome> {
        if let Some(failure) = *self.fail_wait_for_node.lock().unwrap() {
            return Err(scripted_err(failure));
        }
        let mut outcomes = self.wait_outcomes.lock().unwrap();
        if outcomes.is_empty() {
            return Ok(WaitOutcome::Node {
                node: "c1-1".to_string(),
            });
        }
        let outcome = outcomes.remove(0);
        Ok(match outcome {
            WaitOutcome::Node { node } => WaitOutcome::Node { node },
            WaitOutcome::Pending { start_time, .. } => WaitOutcome::Pending {
                job_id: job_id.to_string(),
                start_time,
            },
        })
    }

    async fn get_ide_port(
        &self,
        _cluster: &str,
        _identity: &Identity,
        _user: &str,
        ide: crate::jobs::Ide,
    ) -> Result<u16> {
        if let Some(failure) = *self.fail_get_ide_port.lock().unwrap() {
            return Err(scripted_err(failure));
        }
        Ok(self
            .ports
            .lock()
            .unwrap()
            .get(&ide)
            .copied()
            .unwrap_or_else(|| ide.default_remote_port()))
    }

    async fn get_health_snapshot(&self, _cluster: &str, _identity: &Identity) -> Result<HealthSnapshot> {
        Ok(HealthSnapshot::default())
    }
}

pub fn test_identity() -> Identity {
    Identity::for_user("alice", "alice", String::new())
}

/// A `Config` carrying a single cluster, `"testcluster"`, with generous resource limits, so
/// `launch`'s validation step (spec §4.5 step 1) never rejects a test request.
pub fn test_config() -> Config {
    let mut clusters = HashMap::new();
    clusters.insert(
        "testcluster".to_string(),
        ClusterConfig {
            host: "testcluster.example.org".to_string(),
            hpc_user_env: None,
            partition: "normal".to_string(),
            gres_gpu: None,
            releases: vec!["3.20".to_string()],
            gpu_types: vec![],
            ide_allowlist: HashMap::new(),
            max_cpus: 64,
            max_mem_gb: 256,
            max_walltime_hours: 168,
        },
    );
    Config {
        clusters,
        status_cache_ttl: Duration::from_secs(3600),
        jwt_secret: None,
        admin_users: vec![],
        db_path: "unused".to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        session_key_ttl: Duration::from_secs(3600),
    }
}

/// Builds a `SessionManager` around `job_controller` plus a real (but ssh-less) `TunnelManager`,
/// mirroring the teacher's `mocksystem.rs` wiring for exercising state-machine code without a
/// cluster. Returns the tunnel-exit receiver too, for tests on spec §4.5 step 9's own-exit path.
pub fn test_session_manager(
    job_controller: Arc<MockJobController>,
) -> (Arc<SessionManager>, tokio::sync::mpsc::UnboundedReceiver<SessionKey>) {
    let (tunnels, exited_rx) = TunnelManager::new();
    let status_cache = Arc::new(ClusterStatusCache::new(Duration::from_secs(3600)));
    let manager = Arc::new(SessionManager::new(
        job_controller as Arc<dyn JobController>,
        tunnels,
        status_cache,
    ));
    (manager, exited_rx)
}

pub fn test_key(ide: crate::jobs::Ide) -> SessionKey {
    SessionKey {
        user: "alice".to_string(),
        cluster: "testcluster".to_string(),
        ide,
    }
}
