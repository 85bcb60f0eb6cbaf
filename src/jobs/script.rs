// Per-IDE batch script construction. Every sub-script (port finder, bootstrap, IDE config) is
// built as plain text, base64-encoded, and embedded as `echo <b64> | base64 -d > <target>` so
// that none of it ever has to survive the remote shell's own quoting rules.

use base64::Engine;

use super::{Ide, SubmitRequest};

fn embed(target: &str, contents: &str) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(contents.as_bytes());
    format!("echo {b64} | base64 -d > {target}\n")
}

/// The remote shell snippet that scans upward from `default_port` for a free port, records it,
/// and exports it for the parent shell to `eval`. The final line must be the `export` echo.
fn port_finder_script(work_dir: &str, default_port: u16) -> String {
    format!(
        r#"
PORT={default_port}
for i in $(seq 0 100); do
  CANDIDATE=$((PORT + i))
  if ! netstat -ln 2>/dev/null | grep -q ":$CANDIDATE "; then
    PORT=$CANDIDATE
    break
  fi
done
mkdir -p ~/{work_dir}
echo $PORT > ~/{work_dir}/port
export IDE_PORT=$PORT
echo "export IDE_PORT=$PORT"
"#
    )
}

fn redirect_stderr(job_name: &str) -> String {
    format!("exec 2>>/tmp/{job_name}_$SLURM_JOB_ID.err\n")
}

fn common_preamble(req: &SubmitRequest) -> String {
    let mut s = String::new();
    s.push_str("#!/bin/bash\n");
    s.push_str(&redirect_stderr(req.ide.job_name()));
    s.push_str(&format!("mkdir -p ~/{}\n", req.ide.work_dir()));
    s
}

pub fn build_job_script(user: &str, req: &SubmitRequest, token: Option<&str>) -> String {
    match req.ide {
        Ide::Vscode => vscode_script(user, req, token),
        Ide::Rstudio => rstudio_script(user, req),
        Ide::Jupyter => jupyter_script(user, req, token),
    }
}

/// The companion HTTP proxy listens on `$PROXY_PORT` (spec §4.2 step 6, "also launch a companion
/// HTTP proxy that writes its own port file used for dev-server routing") and forwards to
/// whichever of VS Code's dev-server ports is currently in use; it is backgrounded so the
/// foreground `exec` below stays code-server's own process.
fn vscode_proxy_launch_script() -> String {
    "mkdir -p ~/.hpc-proxy\n\
     PROXY_PORT=$((IDE_PORT + 1000))\n\
     echo $PROXY_PORT > ~/.hpc-proxy/port\n\
     (singularity exec --bind /cluster/releases container.sif hpc-dev-proxy --listen 0.0.0.0:$PROXY_PORT --target 127.0.0.1 > ~/.hpc-proxy/proxy.log 2>&1 &)\n\
     echo ready > ~/.hpc-proxy/status\n"
        .to_string()
}

fn vscode_script(user: &str, req: &SubmitRequest, token: Option<&str>) -> String {
    let mut s = common_preamble(req);
    let config = format!(
        "{{\"release\":\"{}\",\"cpus\":{},\"user\":\"{}\"}}\n",
        req.release, req.cpus, user
    );
    s.push_str(&embed("~/.vscode-slurm/config.json", &config));
    s.push_str(&port_finder_script(req.ide.work_dir(), req.ide.default_remote_port()));
    // $PORT (exported as $IDE_PORT above) is already in scope for the rest of this same script.
    s.push_str(&vscode_proxy_launch_script());
    let token = token.expect("vscode sessions always carry an auth token");
    s.push_str(&format!(
        "export PASSWORD={token}\nexec singularity exec --bind /cluster/releases/{release} container.sif code-server --bind-addr 0.0.0.0:$IDE_PORT --auth password\n",
        release = req.release,
    ));
    s
}

fn rstudio_script(user: &str, req: &SubmitRequest) -> String {
    let mut s = common_preamble(req);
    let _ = user;
    s.push_str(&port_finder_script(req.ide.work_dir(), req.ide.default_remote_port()));
    // RStudio trusts the reverse proxy to have already authenticated the user.
    s.push_str(&format!(
        "exec singularity exec --bind /cluster/releases/{release} container.sif rserver --www-port=$IDE_PORT --auth-none=1\n",
        release = req.release,
    ));
    s
}

fn jupyter_script(user: &str, req: &SubmitRequest, token: Option<&str>) -> String {
    let mut s = common_preamble(req);
    let config = format!("{{\"release\":\"{}\",\"user\":\"{}\"}}\n", req.release, user);
    s.push_str(&embed("~/.jupyter-slurm/config.json", &config));
    s.push_str(&port_finder_script(req.ide.work_dir(), req.ide.default_remote_port()));
    let token = token.expect("jupyter sessions always carry an auth token");
    s.push_str(&format!(
        "exec singularity exec --bind /cluster/releases/{release} container.sif jupyter lab --ip=0.0.0.0 --port=$IDE_PORT --no-browser --ServerApp.token={token}\n",
        release = req.release,
    ));
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::SubmitRequest;

    fn req(ide: Ide) -> SubmitRequest {
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

    #[test]
    fn port_finder_last_line_is_export() {
        let script = port_finder_script("vscode-slurm", 8080);
        let last = script.lines().filter(|l| !l.trim().is_empty()).last().unwrap();
        assert_eq!(last.trim(), "echo \"export IDE_PORT=$PORT\"");
    }

    #[test]
    fn vscode_script_embeds_config_and_port_finder() {
        let script = build_job_script("alice", &req(Ide::Vscode), Some("tok-123"));
        assert!(script.contains("base64 -d"));
        assert!(script.contains("code-server"));
    }

    #[test]
    fn vscode_script_carries_auth_token_and_launches_proxy() {
        let script = build_job_script("alice", &req(Ide::Vscode), Some("tok-123"));
        assert!(script.contains("--auth password"));
        assert!(script.contains("PASSWORD=tok-123"));
        assert!(script.contains("hpc-dev-proxy"));
        assert!(!script.contains("--auth none"));
    }

    #[test]
    fn jupyter_script_carries_auth_token() {
        let script = build_job_script("alice", &req(Ide::Jupyter), Some("tok-456"));
        assert!(script.contains("--ServerApp.token=tok-456"));
    }

    #[test]
    fn rstudio_script_uses_no_auth() {
        let script = build_job_script("alice", &req(Ide::Rstudio), None);
        assert!(script.contains("--auth-none=1"));
    }
}
