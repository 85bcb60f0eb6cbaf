// Job controller: submit, query, wait, cancel SLURM jobs and read the port an IDE ends up
// listening on. Queue parsing lives in `parse`, per-IDE batch script construction in `script`.

mod health;
mod parse;
mod script;

pub use health::{parse_health_snapshot, HealthSnapshot};
pub use parse::parse_queue;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GatewayError, Result};
use crate::ssh::{Identity, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ide {
    Vscode,
    Rstudio,
    Jupyter,
}

impl Ide {
    pub const ALL: [Ide; 3] = [Ide::Vscode, Ide::Rstudio, Ide::Jupyter];

    /// Job name `squeue`/`sbatch` use to identify this IDE's batch jobs, e.g. `vscode-slurm`.
    pub fn job_name(&self) -> &'static str {
        match self {
            Ide::Vscode => "vscode-slurm",
            Ide::Rstudio => "rstudio-slurm",
            Ide::Jupyter => "jupyter-slurm",
        }
    }

    pub fn from_job_name(name: &str) -> Option<Ide> {
        Ide::ALL.into_iter().find(|ide| ide.job_name() == name)
    }

    /// Fixed local tunnel port; the UI depends on a stable URL per IDE.
    pub fn local_port(&self) -> u16 {
        match self {
            Ide::Vscode => 8080,
            Ide::Rstudio => 8787,
            Ide::Jupyter => 8888,
        }
    }

    /// Default remote port the port finder starts scanning from.
    pub fn default_remote_port(&self) -> u16 {
        self.local_port()
    }

    /// Per-IDE on-cluster working directory under the user's home.
    pub fn work_dir(&self) -> &'static str {
        match self {
            Ide::Vscode => ".vscode-slurm",
            Ide::Rstudio => ".rstudio-slurm",
            Ide::Jupyter => ".jupyter-slurm",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Ide::Vscode => "vscode",
            Ide::Rstudio => "rstudio",
            Ide::Jupyter => "jupyter",
        }
    }
}

impl std::fmt::Display for Ide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub ide: Ide,
    pub state: JobState,
    pub node: Option<String>,
    pub time_left: Option<String>,
    pub time_limit: Option<String>,
    pub cpus: Option<u32>,
    pub memory: Option<String>,
    pub start_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuSpec {
    pub gres: String,
    pub count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub ide: Ide,
    pub cpus: u32,
    pub mem_gb: u32,
    pub walltime_hours: u32,
    pub release: String,
    pub gpu: Option<GpuSpec>,
    pub account: Option<String>,
}

pub struct SubmitResult {
    pub job_id: String,
    /// Auth token for VS Code/Jupyter sessions, spec §4.2 step 5 / §4.5 step 10. `None` for
    /// RStudio, which trusts the reverse proxy instead ("no-auth").
    pub token: Option<String>,
}

pub enum WaitOutcome {
    Node { node: String },
    Pending { job_id: String, start_time: Option<String> },
}

#[async_trait::async_trait]
pub trait JobController: Send + Sync {
    async fn get_job_info(&self, cluster: &str, identity: &Identity, user: &str, ide: Ide) -> Result<Option<JobRecord>>;
    async fn get_all_jobs(&self, cluster: &str, identity: &Identity, user: &str) -> Result<HashMap<Ide, JobRecord>>;
    async fn submit_job(&self, cluster: &str, identity: &Identity, user: &str, req: &SubmitRequest) -> Result<SubmitResult>;
    async fn cancel_job(&self, cluster: &str, identity: &Identity, job_id: &str) -> Result<()>;
    async fn cancel_jobs(&self, cluster: &str, identity: &Identity, job_ids: &[String]) -> Result<(Vec<String>, Vec<String>)>;
    async fn wait_for_node(
        &self,
        cluster: &str,
        identity: &Identity,
        user: &str,
        ide: Ide,
        job_id: &str,
        max_attempts: u32,
        return_pending_on_timeout: bool,
    ) -> Result<WaitOutcome>;
    async fn get_ide_port(&self, cluster: &str, identity: &Identity, user: &str, ide: Ide) -> Result<u16>;
    /// Health snapshot, spec §4.2: served through this component but consumed by external
    /// collaborators (the cluster-health dashboard, out of scope per spec §1 Non-goals).
    async fn get_health_snapshot(&self, cluster: &str, identity: &Identity) -> Result<HealthSnapshot>;
}

pub struct RealJobController {
    transport: std::sync::Arc<dyn Transport>,
    /// Cluster identifier (e.g. `gemini`) -> SSH-resolvable login host (e.g.
    /// `gemini-login.example.edu`), per spec §6's per-cluster static configuration. The
    /// controller's own public methods keep taking the identifier, matching spec §4.2's
    /// signatures; this map is where that identifier turns into something `ssh` can dial.
    hosts: HashMap<String, String>,
}

impl RealJobController {
    pub fn new(transport: std::sync::Arc<dyn Transport>, hosts: HashMap<String, String>) -> Self {
        RealJobController { transport, hosts }
    }

    fn host(&self, cluster: &str) -> Result<&str> {
        self.hosts
            .get(cluster)
            .map(String::as_str)
            .ok_or_else(|| GatewayError::Validation(format!("unknown cluster {cluster}")))
    }

    async fn query_queue(&self, cluster: &str, identity: &Identity, user: &str) -> Result<HashMap<Ide, JobRecord>> {
        let names = Ide::ALL.map(|i| i.job_name()).join(",");
        let format = "%i|%j|%T|%N|%L|%l|%C|%m|%S";
        let script = format!(
            "squeue -u {user} -n {names} --noheader --format='{format}'\n",
            user = shell_quote(user),
        );
        let out = self.transport.execute(self.host(cluster)?, identity, &script).await?;
        Ok(parse::parse_queue(&out))
    }
}

#[async_trait::async_trait]
impl JobController for RealJobController {
    async fn get_job_info(&self, cluster: &str, identity: &Identity, user: &str, ide: Ide) -> Result<Option<JobRecord>> {
        let jobs = self.query_queue(cluster, identity, user).await?;
        Ok(jobs.get(&ide).cloned())
    }

    async fn get_all_jobs(&self, cluster: &str, identity: &Identity, user: &str) -> Result<HashMap<Ide, JobRecord>> {
        self.query_queue(cluster, identity, user).await
    }

    async fn submit_job(&self, cluster: &str, identity: &Identity, user: &str, req: &SubmitRequest) -> Result<SubmitResult> {
        // spec §4.2 step 5: VS Code and Jupyter need an auth token baked into the job script;
        // RStudio relies on the reverse proxy having already authenticated the user.
        let token = match req.ide {
            Ide::Vscode | Ide::Jupyter => Some(uuid::Uuid::new_v4().simple().to_string()),
            Ide::Rstudio => None,
        };
        let batch_script = script::build_job_script(user, req, token.as_deref());
        let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, batch_script.as_bytes());

        let mem_mb = req.mem_gb * 1024;
        let mut sbatch = format!(
            "--job-name={job_name} --nodes=1 --cpus-per-task={cpus} --mem={mem}M --time={walltime}:00:00",
            job_name = req.ide.job_name(),
            cpus = req.cpus,
            mem = mem_mb,
            walltime = req.walltime_hours,
        );
        if let Some(gpu) = &req.gpu {
            sbatch.push_str(&format!(" --gres={}:{}", gpu.gres, gpu.count));
        }
        if let Some(account) = &req.account {
            sbatch.push_str(&format!(" --account={}", shell_quote(account)));
        }
        sbatch.push_str(&format!(
            " --output=/tmp/{job_name}_%j.log --error=/tmp/{job_name}_%j.err",
            job_name = req.ide.job_name(),
        ));

        let submit_script = format!(
            "echo {b64} | base64 -d > /tmp/hpc-gateway-submit-$$.sh\nsbatch {sbatch} /tmp/hpc-gateway-submit-$$.sh\nrm -f /tmp/hpc-gateway-submit-$$.sh\n",
        );

        let out = self.transport.execute(self.host(cluster)?, identity, &submit_script).await?;
        let job_id = out
            .lines()
            .find_map(|l| l.strip_prefix("Submitted batch job ").map(|s| s.trim().to_string()))
            .ok_or_else(|| GatewayError::Submit(format!("could not parse job id from: {out}")))?;
        Ok(SubmitResult { job_id, token })
    }

    async fn cancel_job(&self, cluster: &str, identity: &Identity, job_id: &str) -> Result<()> {
        let script = format!("scancel {}\n", shell_quote(job_id));
        self.transport.execute(self.host(cluster)?, identity, &script).await?;
        Ok(())
    }

    async fn cancel_jobs(&self, cluster: &str, identity: &Identity, job_ids: &[String]) -> Result<(Vec<String>, Vec<String>)> {
        if job_ids.is_empty() {
            return Ok((vec![], vec![]));
        }
        let joined = job_ids.iter().map(|s| shell_quote(s)).collect::<Vec<_>>().join(" ");
        let script = format!("scancel {joined}\n");
        let host = self.host(cluster)?;
        match self.transport.execute(host, identity, &script).await {
            Ok(_) => Ok((job_ids.to_vec(), vec![])),
            Err(_) => Ok((vec![], job_ids.to_vec())),
        }
    }

    async fn wait_for_node(
        &self,
        cluster: &str,
        identity: &Identity,
        user: &str,
        ide: Ide,
        job_id: &str,
        max_attempts: u32,
        return_pending_on_timeout: bool,
    ) -> Result<WaitOutcome> {
        let mut last_start_time: Option<String> = None;
        for attempt in 0..max_attempts {
            let jobs = self.query_queue(cluster, identity, user).await?;
            match jobs.get(&ide) {
                Some(job) if job.job_id == job_id && job.state == JobState::Running => {
                    if let Some(node) = &job.node {
                        return Ok(WaitOutcome::Node { node: node.clone() });
                    }
                }
                Some(job) if job.job_id == job_id => {
                    // still pending, keep polling
                    last_start_time = job.start_time.clone();
                }
                None | Some(_) => {
                    return Err(GatewayError::JobGone);
                }
            }
            if attempt + 1 < max_attempts {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
        if return_pending_on_timeout {
            Ok(WaitOutcome::Pending {
                job_id: job_id.to_string(),
                start_time: last_start_time,
            })
        } else {
            Err(GatewayError::Timeout)
        }
    }

    async fn get_ide_port(&self, cluster: &str, identity: &Identity, user: &str, ide: Ide) -> Result<u16> {
        let _ = user;
        let script = format!("cat ~/{}/port 2>/dev/null\n", ide.work_dir());
        let out = self.transport.execute(self.host(cluster)?, identity, &script).await?;
        let port = out.trim().parse::<u32>().ok().filter(|p| *p > 0 && *p <= 65535);
        match port {
            Some(p) => {
                let p = p as u16;
                if p != ide.default_remote_port() {
                    info!(cluster, ide = %ide, port = p, "discovered non-default IDE port");
                }
                Ok(p)
            }
            None => Ok(ide.default_remote_port()),
        }
    }

    async fn get_health_snapshot(&self, cluster: &str, identity: &Identity) -> Result<HealthSnapshot> {
        let script = health::build_health_script();
        let out = self.transport.execute(self.host(cluster)?, identity, &script).await?;
        Ok(health::parse_health_snapshot(&out))
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ide_job_name_round_trips() {
        for ide in Ide::ALL {
            assert_eq!(Ide::from_job_name(ide.job_name()), Some(ide));
        }
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("o'brien"), r"'o'\''brien'");
    }
}
