//! Docker daemon collaborator: load a tarball, tag an image.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use lateen_core::error::{BuildError, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Interface the load step talks to; the default implementation shells out
/// to the `docker` CLI.
#[async_trait]
pub trait DockerClient: Send + Sync {
    /// Load an image tarball into the daemon; returns the daemon's output.
    async fn load(&self, tarball: Vec<u8>) -> Result<String>;

    /// Apply an additional tag to an already-loaded image.
    async fn tag(&self, source: &str, target: &str) -> Result<()>;
}

/// `docker` CLI wrapper.
pub struct CommandDockerClient {
    executable: PathBuf,
}

impl CommandDockerClient {
    pub fn new() -> Self {
        Self {
            executable: PathBuf::from("docker"),
        }
    }

    pub fn with_executable(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

impl Default for CommandDockerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DockerClient for CommandDockerClient {
    async fn load(&self, tarball: Vec<u8>) -> Result<String> {
        let mut child = Command::new(&self.executable)
            .arg("load")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BuildError::Other(format!(
                    "failed to run {} load: {}",
                    self.executable.display(),
                    e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&tarball).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(BuildError::Other(format!(
                "docker load failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        let output = Command::new(&self.executable)
            .args(["tag", source, target])
            .output()
            .await
            .map_err(|e| {
                BuildError::Other(format!(
                    "failed to run {} tag: {}",
                    self.executable.display(),
                    e
                ))
            })?;
        if !output.status.success() {
            return Err(BuildError::Other(format!(
                "docker tag {} {} failed: {}",
                source,
                target,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
