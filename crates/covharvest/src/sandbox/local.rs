//! Host-process sandbox
//!
//! Runs units as ordinary child processes. Sandbox paths are host paths, so
//! the instrumented library must already be importable on the host. Useful
//! when the harvester itself runs inside the instrumented image.

use super::docker::remove_host_path;
use super::{capture, ExecOutput, ExecRequest, Sandbox, SandboxHandle};
use crate::result::{HarvestError, HarvestResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Sandbox that executes directly on the host
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    root: PathBuf,
}

impl LocalSandbox {
    /// Sandbox whose scratch space lives under `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Scratch root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    if src.is_file() {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dst)?;
        return Ok(());
    }
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::from)?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn name(&self) -> &str {
        "local"
    }

    async fn provision(&self) -> HarvestResult<SandboxHandle> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            HarvestError::resource(format!(
                "Cannot create sandbox root {}: {e}",
                self.root.display()
            ))
        })?;
        Ok(SandboxHandle::new(format!("local-{}", uuid::Uuid::new_v4())))
    }

    async fn teardown(&self, _handle: &SandboxHandle) -> HarvestResult<()> {
        Ok(())
    }

    async fn copy_in(&self, _handle: &SandboxHandle, src: &Path, dst: &Path) -> HarvestResult<()> {
        if !src.exists() {
            return Err(HarvestError::input(format!(
                "Source path does not exist: {}",
                src.display()
            )));
        }
        remove_host_path(dst).await?;
        let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
            .await
            .map_err(|e| HarvestError::resource(format!("Copy task failed: {e}")))??;
        Ok(())
    }

    async fn copy_out(
        &self,
        handle: &SandboxHandle,
        src: &Path,
        dst: &Path,
    ) -> HarvestResult<()> {
        if !src.exists() {
            return Err(HarvestError::resource(format!(
                "Sandbox path does not exist: {}",
                src.display()
            )));
        }
        self.copy_in(handle, src, dst).await
    }

    async fn exec(
        &self,
        _handle: &SandboxHandle,
        request: &ExecRequest,
    ) -> HarvestResult<ExecOutput> {
        let Some((program, args)) = request.argv.split_first() else {
            return Err(HarvestError::input("Empty command"));
        };
        debug!(command = %request.rendered(), "local exec");
        let mut command = tokio::process::Command::new(program);
        command.args(args);
        if let Some(ref cwd) = request.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &request.env {
            command.env(key, value);
        }
        capture(command)
            .await
            .map_err(|e| HarvestError::resource(format!("Failed to spawn {program}: {e}")))
    }

    async fn make_dir(&self, _handle: &SandboxHandle, dir: &Path) -> HarvestResult<()> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(())
    }

    async fn remove(&self, _handle: &SandboxHandle, path: &Path) -> HarvestResult<()> {
        remove_host_path(path).await
    }

    async fn file_exists(&self, _handle: &SandboxHandle, path: &Path) -> HarvestResult<bool> {
        Ok(tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
    }

    async fn find_files(
        &self,
        _handle: &SandboxHandle,
        dir: &Path,
        suffix: &str,
    ) -> HarvestResult<Vec<PathBuf>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.file_name().to_string_lossy().ends_with(suffix))
            .map(walkdir::DirEntry::into_path)
            .collect();
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    async fn provisioned(dir: &TempDir) -> (LocalSandbox, SandboxHandle) {
        let sb = LocalSandbox::new(dir.path().join("sandbox"));
        let handle = sb.provision().await.unwrap();
        (sb, handle)
    }

    #[tokio::test]
    async fn test_provision_creates_root() {
        let dir = TempDir::new().unwrap();
        let (sb, handle) = provisioned(&dir).await;
        assert!(sb.root().is_dir());
        assert!(handle.id.starts_with("local-"));
        sb.teardown(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_in_directory_replaces_destination() {
        let dir = TempDir::new().unwrap();
        let (sb, handle) = provisioned(&dir).await;
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("g")).unwrap();
        fs::write(src.join("g/a.py"), "a").unwrap();
        let dst = sb.root().join("inputs/0-60");
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("stale.py"), "old").unwrap();

        sb.copy_in(&handle, &src, &dst).await.unwrap();
        assert!(dst.join("g/a.py").exists());
        assert!(!dst.join("stale.py").exists());
    }

    #[tokio::test]
    async fn test_copy_out_file() {
        let dir = TempDir::new().unwrap();
        let (sb, handle) = provisioned(&dir).await;
        let inside = sb.root().join("profdata/merged.profdata");
        fs::create_dir_all(inside.parent().unwrap()).unwrap();
        fs::write(&inside, "data").unwrap();
        let host = dir.path().join("out/0-60/merged.profdata");
        sb.copy_out(&handle, &inside, &host).await.unwrap();
        assert_eq!(fs::read_to_string(host).unwrap(), "data");
    }

    #[tokio::test]
    async fn test_copy_out_missing_is_error() {
        let dir = TempDir::new().unwrap();
        let (sb, handle) = provisioned(&dir).await;
        let err = sb
            .copy_out(&handle, &sb.root().join("nope"), &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_exec_with_env_and_cwd() {
        let dir = TempDir::new().unwrap();
        let (sb, handle) = provisioned(&dir).await;
        let request = ExecRequest::new(["sh", "-c", "echo $MARK; pwd"])
            .env("MARK", "hello")
            .cwd(sb.root());
        let output = sb.exec(&handle, &request).await.unwrap();
        assert!(output.success());
        assert!(output.stdout.contains("hello"));
        assert!(output.stdout.contains("sandbox"));
    }

    #[tokio::test]
    async fn test_exec_missing_program_is_error() {
        let dir = TempDir::new().unwrap();
        let (sb, handle) = provisioned(&dir).await;
        let request = ExecRequest::new(["/no/such/program"]);
        assert!(sb.exec(&handle, &request).await.is_err());
    }

    #[tokio::test]
    async fn test_find_files_by_suffix() {
        let dir = TempDir::new().unwrap();
        let (sb, handle) = provisioned(&dir).await;
        let raw = sb.root().join("profraw");
        fs::create_dir_all(raw.join("g")).unwrap();
        fs::write(raw.join("g/b.profraw"), "").unwrap();
        fs::write(raw.join("a.profraw"), "").unwrap();
        fs::write(raw.join("a.log"), "").unwrap();
        let found = sb.find_files(&handle, &raw, ".profraw").await.unwrap();
        assert_eq!(found, vec![raw.join("a.profraw"), raw.join("g/b.profraw")]);
        assert!(sb
            .find_files(&handle, &raw.join("missing"), ".profraw")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_file_exists_and_remove() {
        let dir = TempDir::new().unwrap();
        let (sb, handle) = provisioned(&dir).await;
        let file = sb.root().join("f");
        fs::write(&file, "").unwrap();
        assert!(sb.file_exists(&handle, &file).await.unwrap());
        sb.remove(&handle, &file).await.unwrap();
        assert!(!sb.file_exists(&handle, &file).await.unwrap());
    }
}
