// Environment and per-cluster configuration.
//
// Per-cluster definitions (host, partition, release image paths, default IDE ports) are static
// for a deployment and live in a TOML file; the handful of values that genuinely vary by
// deployment environment (cache TTL, JWT secret, admin users) come from environment variables,
// matching the split the spec calls for.

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::jobs::Ide;

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub host: String,
    pub hpc_user_env: Option<String>,
    pub partition: String,
    pub gres_gpu: Option<String>,
    #[serde(default)]
    pub releases: Vec<String>,
    #[serde(default)]
    pub gpu_types: Vec<String>,
    /// Per-release IDE allow-list, keyed by release version. A release with no entry here
    /// allows every `Ide` -- most release images carry all three servers, so only the releases
    /// that deliberately strip one need to be listed.
    #[serde(default)]
    pub ide_allowlist: HashMap<String, Vec<Ide>>,
    #[serde(default = "default_max_cpus")]
    pub max_cpus: u32,
    #[serde(default = "default_max_mem_gb")]
    pub max_mem_gb: u32,
    #[serde(default = "default_max_walltime_hours")]
    pub max_walltime_hours: u32,
}

impl ClusterConfig {
    /// spec §4.5 step 1's "ide availability within the release" check, distinct from cluster-wide
    /// release availability. A release absent from `ide_allowlist` allows every IDE.
    pub fn ide_allowed_for_release(&self, release: &str, ide: Ide) -> bool {
        match self.ide_allowlist.get(release) {
            Some(allowed) => allowed.contains(&ide),
            None => true,
        }
    }
}

fn default_max_cpus() -> u32 {
    64
}
fn default_max_mem_gb() -> u32 {
    256
}
fn default_max_walltime_hours() -> u32 {
    168
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub clusters: HashMap<String, ClusterConfig>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub clusters: HashMap<String, ClusterConfig>,
    pub status_cache_ttl: Duration,
    pub jwt_secret: Option<String>,
    pub admin_users: Vec<String>,
    pub db_path: String,
    pub bind_addr: String,
    pub session_key_ttl: Duration,
}

impl Config {
    pub fn load() -> anyhow::Result<Config> {
        let config_path =
            env::var("HPC_GATEWAY_CONFIG").unwrap_or_else(|_| "./gateway.toml".to_string());
        let toml_cfg = load_toml(Path::new(&config_path))?;

        let status_cache_ttl = env::var("STATUS_CACHE_TTL")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(1_800_000));

        let admin_users = env::var("ADMIN_USERS")
            .or_else(|_| env::var("ADMIN_USER"))
            .ok()
            .map(|s| s.split(',').map(|u| u.trim().to_string()).collect())
            .unwrap_or_default();

        Ok(Config {
            clusters: toml_cfg.clusters,
            status_cache_ttl,
            jwt_secret: env::var("JWT_SECRET").ok(),
            admin_users,
            db_path: env::var("GATEWAY_DB_PATH").unwrap_or_else(|_| "./gateway.db".to_string()),
            bind_addr: env::var("GATEWAY_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            session_key_ttl: Duration::from_secs(14 * 24 * 3600),
        })
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.get(name)
    }
}

fn load_toml(path: &Path) -> anyhow::Result<TomlConfig> {
    if !path.exists() {
        return Ok(TomlConfig {
            clusters: HashMap::new(),
        });
    }
    let text = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_empty_clusters() {
        let cfg = load_toml(Path::new("/nonexistent/gateway.toml")).unwrap();
        assert!(cfg.clusters.is_empty());
    }

    fn cluster_cfg(ide_allowlist: HashMap<String, Vec<Ide>>) -> ClusterConfig {
        ClusterConfig {
            host: "cluster.example.org".to_string(),
            hpc_user_env: None,
            partition: "normal".to_string(),
            gres_gpu: None,
            releases: vec!["3.20".to_string()],
            gpu_types: vec![],
            ide_allowlist,
            max_cpus: 64,
            max_mem_gb: 256,
            max_walltime_hours: 168,
        }
    }

    #[test]
    fn release_with_no_allowlist_entry_permits_every_ide() {
        let cfg = cluster_cfg(HashMap::new());
        assert!(cfg.ide_allowed_for_release("3.20", Ide::Rstudio));
    }

    #[test]
    fn release_with_an_allowlist_entry_rejects_an_ide_not_listed() {
        let mut allowlist = HashMap::new();
        allowlist.insert("3.20".to_string(), vec![Ide::Vscode, Ide::Jupyter]);
        let cfg = cluster_cfg(allowlist);
        assert!(cfg.ide_allowed_for_release("3.20", Ide::Vscode));
        assert!(!cfg.ide_allowed_for_release("3.20", Ide::Rstudio));
    }
}
