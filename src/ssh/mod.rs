// SSH transport: execute a shell script on a cluster's login node over a multiplexed,
// per-cluster serialized channel. This is the async analogue of the teacher's
// `command::safe_command`, which pipes a command through `subprocess::Exec` and drains stdout
// while watching a wall-clock timeout; here the equivalent drain loop is a `tokio::process::Child`
// with piped stdio, read concurrently with the wait, under a `tokio::time::timeout`.

mod identity;
mod queue;

pub use identity::{Identity, IdentityError};
pub use queue::TransportQueue;

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::GatewayError;

const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

// Known-benign stderr lines emitted by some ssh/sshd builds (e.g. post-quantum key-exchange
// notices); stripped before surfacing stderr to the caller, per the transport's error
// normalization rule.
const BENIGN_STDERR_PREFIXES: &[&str] = &[
    "Warning: Permanently added",
    "kex_exchange_identification",
];

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// `host` is the SSH-resolvable login host for a cluster (`ClusterConfig::host`), not the
    /// cluster's short identifier -- callers resolve that mapping before reaching this trait.
    async fn execute(&self, host: &str, identity: &Identity, script: &str) -> crate::error::Result<String>;
}

pub struct RealTransport {
    queue: TransportQueue,
}

impl RealTransport {
    pub fn new() -> Self {
        RealTransport {
            queue: TransportQueue::new(),
        }
    }
}

impl Default for RealTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for RealTransport {
    async fn execute(&self, host: &str, identity: &Identity, script: &str) -> crate::error::Result<String> {
        // Serialize all execution for this cluster through its single-consumer queue: at most
        // one ssh invocation in flight per cluster at a time.
        self.queue
            .submit(host, identity.clone(), script.to_string())
            .await
    }
}

// Run one `ssh ... bash -s` invocation, piping `script` to stdin, and return trimmed stdout.
// Not itself serialized; `TransportQueue` is responsible for ensuring only one call per cluster
// runs at a time.
pub(crate) async fn run_once(
    host: &str,
    identity: &Identity,
    script: &str,
) -> crate::error::Result<String> {
    let key_file = identity
        .materialize()
        .map_err(|e| GatewayError::Transport(format!("no SSH key configured: {e}")))?;

    let control_path = identity.control_path(host);

    let mut cmd = Command::new("ssh");
    cmd.arg("-i")
        .arg(key_file.path())
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg("ControlMaster=auto")
        .arg("-o")
        .arg(format!("ControlPath={}", control_path))
        .arg("-o")
        .arg("ControlPersist=30m")
        .arg(format!("{}@{}", identity.hpc_user, host))
        .arg("bash -s")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(cluster = host, "executing script over ssh");

    let mut child = cmd
        .spawn()
        .map_err(|e| GatewayError::Transport(format!("could not start ssh: {e}")))?;

    let mut stdin = child.stdin.take().expect("stdin piped");
    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    let script_owned = script.to_string();
    let writer = tokio::spawn(async move {
        let _ = stdin.write_all(script_owned.as_bytes()).await;
        drop(stdin);
    });

    let read_stdout = async {
        let mut buf = String::new();
        let _ = stdout.read_to_string(&mut buf).await;
        buf
    };
    let read_stderr = async {
        let mut buf = String::new();
        let _ = stderr.read_to_string(&mut buf).await;
        buf
    };

    let fut = async {
        let (_, out, err) = tokio::join!(writer, read_stdout, read_stderr);
        let status = child.wait().await;
        (status, out, err)
    };

    let (status, stdout_text, stderr_text) = match timeout(EXEC_TIMEOUT, fut).await {
        Ok(v) => v,
        Err(_) => {
            let _ = child.start_kill();
            return Err(GatewayError::Transport(format!(
                "ssh to {host} timed out after {:?}",
                EXEC_TIMEOUT
            )));
        }
    };

    let stderr_clean = strip_benign_stderr(&stderr_text);

    match status {
        Ok(status) if status.success() => Ok(stdout_text.trim().to_string()),
        Ok(_) => {
            if !stderr_clean.is_empty() {
                warn!(cluster = host, stderr = %stderr_clean, "ssh exec failed");
                Err(GatewayError::Transport(stderr_clean))
            } else {
                Err(GatewayError::Transport(format!(
                    "ssh to {host} exited with an error and no stderr"
                )))
            }
        }
        Err(e) => Err(GatewayError::Transport(format!("ssh process error: {e}"))),
    }
}

fn strip_benign_stderr(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|l| {
            !BENIGN_STDERR_PREFIXES
                .iter()
                .any(|prefix| l.trim_start().starts_with(prefix))
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
