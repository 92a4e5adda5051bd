//! Isolated execution environment
//!
//! A [`Sandbox`] is provisioned once per pipeline run and torn down once at
//! the end. Every call takes the [`SandboxHandle`] explicitly; there is no
//! ambient container state.
//!
//! Paths passed as "sandbox paths" are interpreted inside the environment
//! (inside the container for [`DockerSandbox`], on the host for
//! [`LocalSandbox`]).

mod docker;
mod local;

pub use docker::{ContainerState, DockerSandbox, DockerSandboxBuilder};
pub use local::LocalSandbox;

use crate::result::{HarvestError, HarvestResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

/// Opaque reference to a provisioned sandbox
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxHandle {
    /// Container id, or a generated id for host sandboxes
    pub id: String,
}

impl SandboxHandle {
    /// Wrap an id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.id.chars().take(12).collect();
        write!(f, "{short}")
    }
}

/// One command to execute inside the sandbox
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    /// Program and arguments
    pub argv: Vec<String>,
    /// Working directory (sandbox path)
    pub cwd: Option<PathBuf>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Hard limit the sandbox may enforce on its side as well
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    /// Request for `argv` with no cwd, env or timeout
    #[must_use]
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set working directory
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the sandbox-side timeout
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Command line for log messages
    #[must_use]
    pub fn rendered(&self) -> String {
        self.argv.join(" ")
    }
}

/// Captured result of an [`ExecRequest`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Exit code; `None` when terminated by a signal
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the command exited with status zero
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Contract of the instrumented execution environment
#[async_trait]
pub trait Sandbox: Send + Sync + fmt::Debug {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Acquire the environment
    async fn provision(&self) -> HarvestResult<SandboxHandle>;

    /// Release the environment
    async fn teardown(&self, handle: &SandboxHandle) -> HarvestResult<()>;

    /// Copy a host file or directory to `dst`, replacing anything there
    async fn copy_in(&self, handle: &SandboxHandle, src: &Path, dst: &Path) -> HarvestResult<()>;

    /// Copy a sandbox file or directory to host `dst`, replacing anything there
    async fn copy_out(&self, handle: &SandboxHandle, src: &Path, dst: &Path)
        -> HarvestResult<()>;

    /// Run a command and capture its output
    async fn exec(&self, handle: &SandboxHandle, request: &ExecRequest)
        -> HarvestResult<ExecOutput>;

    /// Create a directory and its parents
    async fn make_dir(&self, handle: &SandboxHandle, dir: &Path) -> HarvestResult<()> {
        let request = ExecRequest::new(["mkdir".to_string(), "-p".to_string(), path_arg(dir)]);
        let output = self.exec(handle, &request).await?;
        if !output.success() {
            return Err(HarvestError::resource(format!(
                "Failed to create {} in sandbox: {}",
                dir.display(),
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Remove a file or directory tree; missing paths are not an error
    async fn remove(&self, handle: &SandboxHandle, path: &Path) -> HarvestResult<()> {
        let request = ExecRequest::new(["rm".to_string(), "-rf".to_string(), path_arg(path)]);
        let output = self.exec(handle, &request).await?;
        if !output.success() {
            return Err(HarvestError::resource(format!(
                "Failed to remove {} in sandbox: {}",
                path.display(),
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Whether a regular file exists
    async fn file_exists(&self, handle: &SandboxHandle, path: &Path) -> HarvestResult<bool> {
        let request = ExecRequest::new(["test".to_string(), "-f".to_string(), path_arg(path)]);
        Ok(self.exec(handle, &request).await?.success())
    }

    /// Regular files below `dir` whose name ends with `suffix`, sorted
    async fn find_files(
        &self,
        handle: &SandboxHandle,
        dir: &Path,
        suffix: &str,
    ) -> HarvestResult<Vec<PathBuf>> {
        let request = ExecRequest::new([
            "find".to_string(),
            path_arg(dir),
            "-type".to_string(),
            "f".to_string(),
            "-name".to_string(),
            format!("*{suffix}"),
        ]);
        let output = self.exec(handle, &request).await?;
        if !output.success() {
            return Err(HarvestError::resource(format!(
                "Failed to list {} in sandbox: {}",
                dir.display(),
                output.stderr.trim()
            )));
        }
        let mut files: Vec<PathBuf> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect();
        files.sort();
        Ok(files)
    }
}

/// Render a path as a command-line argument
#[must_use]
pub fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Spawn `command` with piped output and wait for it.
///
/// On unix the child leads its own process group. Dropping the returned
/// future (a timeout or a shutdown) kills the whole group, so processes the
/// child started do not outlive it.
pub(crate) async fn capture(mut command: tokio::process::Command) -> std::io::Result<ExecOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let child = command.spawn()?;
    let mut group = ProcessGroupGuard::new(child.id());
    let output = child.wait_with_output().await?;
    group.disarm();
    Ok(ExecOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Kills a child's process group unless disarmed after a normal exit
#[derive(Debug)]
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        let pgid = pid.filter(|&p| p != 0 && i32::try_from(p).is_ok());
        Self { pgid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let result = std::process::Command::new("kill")
        .args(["-9", "--", &format!("-{pgid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        tracing::warn!(pgid, error = %e, "failed to kill process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(pgid: u32) {
    let _ = pgid;
}
