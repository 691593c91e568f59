//! Per-run isolated root directory for the external certificate tool.
//!
//! Files are staged under the jail root with owner-only permissions and
//! commands run through an `unshare`d chroot so the tool sees nothing of
//! the host beyond what was explicitly copied in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::CaError;
use crate::logging::redact;

/// Captured result of a command run inside the jail. A non-zero exit is
/// reported here, not as an error.
#[derive(Debug)]
pub struct RunOutput {
    pub exit: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct Jail {
    root: PathBuf,
}

impl Jail {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Jail paths are always relative to the root; a leading "/" refers
    /// to the jail root, not the host's.
    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Namespace wrapper prefix for every command: fresh mount, UTS,
    /// IPC, network, PID, user and cgroup namespaces, rooted at the
    /// jail.
    fn unshare_prefix(&self) -> Vec<String> {
        vec![
            "unshare".to_string(),
            "-muinpUCT".to_string(),
            "-r".to_string(),
            "chroot".to_string(),
            self.root.display().to_string(),
        ]
    }

    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), CaError> {
        debug!("Writing file: {}", path);
        let real_path = self.resolve(path);
        if let Some(parent) = real_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::try_exists(&real_path).await? {
            return Err(CaError::FileExists(real_path));
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let mut file = options.open(&real_path).await?;
        file.write_all(contents).await?;
        Ok(())
    }

    pub async fn read_file(&self, path: &str) -> Result<String, CaError> {
        debug!("Reading file: {}", path);
        Ok(tokio::fs::read_to_string(self.resolve(path)).await?)
    }

    pub async fn create_folder(&self, path: &str) -> Result<(), CaError> {
        debug!("Creating folder: {}", path);
        tokio::fs::create_dir_all(self.resolve(path)).await?;
        Ok(())
    }

    pub async fn delete_folder(&self, path: &str) -> Result<(), CaError> {
        debug!("Deleting folder: {}", path);
        tokio::fs::remove_dir_all(self.resolve(path)).await?;
        Ok(())
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), CaError> {
        debug!("Deleting file: {}", path);
        let real_path = self.resolve(path);
        if tokio::fs::try_exists(&real_path).await? {
            tokio::fs::remove_file(&real_path).await?;
        }
        Ok(())
    }

    /// Mirror a host file into the jail at the same absolute path, so
    /// binaries find their libraries where the dynamic linker expects
    /// them.
    pub async fn copy_file(&self, host_path: &str) -> Result<(), CaError> {
        debug!("Copying file: {}", host_path);
        let dest = self.resolve(host_path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(host_path, &dest).await?;
        Ok(())
    }

    /// Run a command inside the jail's namespace set. The child inherits
    /// nothing of the host environment unless `env` is given.
    pub async fn run(
        &self,
        command: &[String],
        stdin: Option<&str>,
        env: Option<&HashMap<String, String>>,
    ) -> Result<RunOutput, CaError> {
        let mut full = self.unshare_prefix();
        full.extend_from_slice(command);
        debug!("Running command: {}", redact(&full.join(" ")));

        let mut cmd = Command::new(&full[0]);
        cmd.args(&full[1..])
            .env_clear()
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(env) = env {
            cmd.envs(env);
        }

        let mut child = cmd.spawn()?;
        if let Some(input) = stdin {
            if let Some(mut handle) = child.stdin.take() {
                handle.write_all(input.as_bytes()).await?;
            }
        }
        let output = child.wait_with_output().await?;

        Ok(RunOutput {
            exit: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Delete staged working state; `full` removes the whole jail tree.
    /// Callers must reach this on every control-flow exit.
    pub async fn cleanup(&self, full: bool) -> Result<(), CaError> {
        let tmp = self.resolve("/tmp");
        if tokio::fs::try_exists(&tmp).await? {
            tokio::fs::remove_dir_all(&tmp).await?;
        }
        if full && tokio::fs::try_exists(&self.root).await? {
            tokio::fs::remove_dir_all(&self.root).await?;
        }
        Ok(())
    }
}
