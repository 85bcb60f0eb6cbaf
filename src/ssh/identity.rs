// Key selection and the ephemeral on-disk materialization `ssh -i` requires.
//
// Decrypted private key bytes live only in the in-memory TTL-bounded session-key store
// (`crate::auth::keystore`); they are never persisted. `ssh` itself has no way to take a key from
// memory, so `materialize()` writes the bytes to a 0600 file under the OS temp directory for the
// lifetime of a single invocation and removes it on drop.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("no SSH key configured")]
    NoKeyConfigured,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone)]
pub struct Identity {
    pub hpc_user: String,
    /// A label used both for logging and to key the per-(identity, cluster) control socket path,
    /// e.g. `user:alice` or `admin-fallback`.
    pub label: String,
    private_key_pem: String,
}

impl Identity {
    pub fn for_user(hpc_user: impl Into<String>, username: &str, private_key_pem: String) -> Identity {
        Identity {
            hpc_user: hpc_user.into(),
            label: format!("user:{username}"),
            private_key_pem,
        }
    }

    pub fn admin_fallback(hpc_user: impl Into<String>, private_key_pem: String) -> Identity {
        Identity {
            hpc_user: hpc_user.into(),
            label: "admin-fallback".to_string(),
            private_key_pem,
        }
    }

    pub fn control_path(&self, cluster_host: &str) -> String {
        let dir = std::env::temp_dir();
        let safe_label = self.label.replace(['/', ':'], "_");
        dir.join(format!("hpc-gateway-ctl-{safe_label}-{cluster_host}"))
            .to_string_lossy()
            .to_string()
    }

    pub fn materialize(&self) -> Result<TempKeyFile, IdentityError> {
        if self.private_key_pem.trim().is_empty() {
            return Err(IdentityError::NoKeyConfigured);
        }
        let path = std::env::temp_dir().join(format!(
            "hpc-gateway-key-{}-{}",
            self.label.replace(['/', ':'], "_"),
            uuid::Uuid::new_v4()
        ));
        fs::write(&path, &self.private_key_pem)?;
        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        Ok(TempKeyFile { path })
    }
}

pub struct TempKeyFile {
    path: PathBuf,
}

impl TempKeyFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempKeyFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
