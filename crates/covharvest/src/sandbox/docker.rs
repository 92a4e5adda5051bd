//! Docker-backed sandbox
//!
//! Drives the `docker` CLI against one long-lived container started from the
//! instrumented image.
//!
//! ```text
//! provision ──► docker images -q <image>      (image must exist)
//!           ──► docker rm -f <name>           (stale container from a crash)
//!           ──► docker run -td --name <name> <image>
//! exec      ──► docker exec [-w cwd] [-e K=V].. <id> [timeout -s KILL n] argv..
//! teardown  ──► docker stop <id> ; docker rm -fv <id>
//! ```

use super::{capture, path_arg, ExecOutput, ExecRequest, Sandbox, SandboxHandle};
use crate::result::{HarvestError, HarvestResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Container lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContainerState {
    /// Container not created yet
    #[default]
    NotCreated,
    /// `docker run` in progress
    Starting,
    /// Container is running
    Running,
    /// `docker stop` in progress
    Stopping,
    /// Container was removed
    Removed,
    /// Lifecycle command failed
    Error,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotCreated => write!(f, "not_created"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Removed => write!(f, "removed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Builder for [`DockerSandbox`]
#[derive(Debug, Clone)]
pub struct DockerSandboxBuilder {
    docker: String,
    image: String,
    container_name: String,
    kill_inside: bool,
}

impl Default for DockerSandboxBuilder {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
            image: String::new(),
            container_name: format!("covharvest-{}", uuid::Uuid::new_v4()),
            kill_inside: true,
        }
    }
}

impl DockerSandboxBuilder {
    /// Creates a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the image to start
    #[must_use]
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Sets the container name
    #[must_use]
    pub fn container_name(mut self, name: impl Into<String>) -> Self {
        self.container_name = name.into();
        self
    }

    /// Sets the docker executable
    #[must_use]
    pub fn docker_binary(mut self, docker: impl Into<String>) -> Self {
        self.docker = docker.into();
        self
    }

    /// Whether timed requests are wrapped in `timeout -s KILL` in the container
    #[must_use]
    pub const fn kill_inside(mut self, enabled: bool) -> Self {
        self.kill_inside = enabled;
        self
    }

    /// Builds the sandbox
    pub fn build(self) -> HarvestResult<DockerSandbox> {
        if self.image.is_empty() {
            return Err(HarvestError::input("Container image not specified"));
        }
        if self.container_name.is_empty() {
            return Err(HarvestError::input("Container name not specified"));
        }
        Ok(DockerSandbox {
            docker: self.docker,
            image: self.image,
            container_name: self.container_name,
            kill_inside: self.kill_inside,
            state: Mutex::new(ContainerState::NotCreated),
        })
    }
}

/// Sandbox backed by a Docker container
#[derive(Debug)]
pub struct DockerSandbox {
    docker: String,
    image: String,
    container_name: String,
    kill_inside: bool,
    state: Mutex<ContainerState>,
}

impl DockerSandbox {
    /// Creates a new builder
    #[must_use]
    pub fn builder() -> DockerSandboxBuilder {
        DockerSandboxBuilder::new()
    }

    /// Image this sandbox starts
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Container name
    #[must_use]
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ContainerState::Error)
    }

    fn set_state(&self, state: ContainerState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    /// Arguments for `docker exec` (without the docker binary)
    #[must_use]
    pub fn exec_args(&self, handle: &SandboxHandle, request: &ExecRequest) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if let Some(ref cwd) = request.cwd {
            args.push("-w".to_string());
            args.push(path_arg(cwd));
        }
        for (key, value) in &request.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(handle.id.clone());
        if let (true, Some(limit)) = (self.kill_inside, request.timeout) {
            args.extend([
                "timeout".to_string(),
                "-s".to_string(),
                "KILL".to_string(),
                limit.as_secs().max(1).to_string(),
            ]);
        }
        args.extend(request.argv.iter().cloned());
        args
    }

    async fn docker(&self, args: &[String]) -> HarvestResult<ExecOutput> {
        debug!(command = %args.join(" "), "docker");
        let mut command = tokio::process::Command::new(&self.docker);
        command.args(args);
        capture(command).await.map_err(|e| {
            HarvestError::resource(format!("Failed to invoke {}: {e}", self.docker))
        })
    }

    async fn docker_checked(&self, args: &[String], what: &str) -> HarvestResult<ExecOutput> {
        let output = self.docker(args).await?;
        if !output.success() {
            return Err(HarvestError::resource(format!(
                "{what}: {}",
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    async fn check_image(&self) -> HarvestResult<()> {
        let output = self
            .docker_checked(
                &strings(&["images", "-q", &self.image]),
                "Failed to query Docker images",
            )
            .await?;
        if output.stdout.trim().is_empty() {
            return Err(HarvestError::resource(format!(
                "Docker image '{}' not found. Please build it via build.sh",
                self.image
            )));
        }
        Ok(())
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &str {
        &self.container_name
    }

    async fn provision(&self) -> HarvestResult<SandboxHandle> {
        self.check_image().await?;
        // A crashed earlier run may have left a container with our name.
        let _ = self.docker(&strings(&["rm", "-f", &self.container_name])).await;

        self.set_state(ContainerState::Starting);
        info!(name = %self.container_name, image = %self.image, "creating container");
        let output = match self
            .docker_checked(
                &strings(&["run", "-td", "--name", &self.container_name, &self.image]),
                "Failed to create Docker container",
            )
            .await
        {
            Ok(output) => output,
            Err(e) => {
                self.set_state(ContainerState::Error);
                return Err(e);
            }
        };
        let id = output.stdout.trim().to_string();
        if id.is_empty() {
            self.set_state(ContainerState::Error);
            return Err(HarvestError::resource("docker run returned no container id"));
        }
        self.set_state(ContainerState::Running);
        Ok(SandboxHandle::new(id))
    }

    async fn teardown(&self, handle: &SandboxHandle) -> HarvestResult<()> {
        self.set_state(ContainerState::Stopping);
        info!(name = %self.container_name, "stopping container");
        let stopped = self
            .docker_checked(
                &strings(&["stop", &handle.id]),
                "Failed to stop Docker container",
            )
            .await;
        if let Err(ref e) = stopped {
            warn!(error = %e, "stop failed, removing anyway");
        }

        info!(name = %self.container_name, "removing container");
        let removed = self
            .docker_checked(
                &strings(&["rm", "-fv", &handle.id]),
                "Failed to remove Docker container",
            )
            .await;
        match removed {
            Ok(_) => {
                self.set_state(ContainerState::Removed);
                stopped.map(|_| ())
            }
            Err(e) => {
                self.set_state(ContainerState::Error);
                Err(e)
            }
        }
    }

    async fn copy_in(&self, handle: &SandboxHandle, src: &Path, dst: &Path) -> HarvestResult<()> {
        let src = if src.is_absolute() {
            src.to_path_buf()
        } else {
            std::env::current_dir()?.join(src)
        };
        if !src.exists() {
            return Err(HarvestError::input(format!(
                "Source path does not exist: {}",
                src.display()
            )));
        }
        if let Some(parent) = dst.parent() {
            self.make_dir(handle, parent).await?;
        }
        self.remove(handle, dst).await?;
        let target = format!("{}:{}", handle.id, path_arg(dst));
        self.docker_checked(
            &["cp".to_string(), path_arg(&src), target.clone()],
            &format!("Failed to copy '{}' to '{target}'", src.display()),
        )
        .await?;
        debug!(src = %src.display(), dst = %target, "copied into container");
        Ok(())
    }

    async fn copy_out(
        &self,
        handle: &SandboxHandle,
        src: &Path,
        dst: &Path,
    ) -> HarvestResult<()> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        remove_host_path(dst).await?;
        let source = format!("{}:{}", handle.id, path_arg(src));
        self.docker_checked(
            &["cp".to_string(), source.clone(), path_arg(dst)],
            &format!("Failed to copy '{source}' to host '{}'", dst.display()),
        )
        .await?;
        debug!(src = %source, dst = %dst.display(), "copied from container");
        Ok(())
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        request: &ExecRequest,
    ) -> HarvestResult<ExecOutput> {
        if request.argv.is_empty() {
            return Err(HarvestError::input("Empty command"));
        }
        self.docker(&self.exec_args(handle, request)).await
    }
}

pub(super) async fn remove_host_path(path: &Path) -> HarvestResult<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await?,
        Ok(_) => tokio::fs::remove_file(path).await?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
