//! Profile Merger
//!
//! Raw profiles of a bucket merge into one bucket profile, and bucket
//! profiles fold, in label order, into a running cumulative profile.
//! The cumulative file on the host is only ever replaced by rename.

use crate::bucket::BucketLabel;
use crate::result::{HarvestError, HarvestResult};
use crate::sandbox::{path_arg, ExecRequest, Sandbox, SandboxHandle};
use crate::tools::ToolResolver;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Suffix of raw profiles written by instrumented runs
pub const RAW_PROFILE_SUFFIX: &str = ".profraw";

/// Something that merges profile artifacts inside a sandbox
#[async_trait]
pub trait MergeTool: Send + Sync + fmt::Debug {
    /// Resolve anything the tool needs before the first merge
    async fn prepare(&self, _sandbox: &dyn Sandbox, _handle: &SandboxHandle) -> HarvestResult<()> {
        Ok(())
    }

    /// Merge `inputs` into `output`; all paths are sandbox paths
    async fn merge(
        &self,
        sandbox: &dyn Sandbox,
        handle: &SandboxHandle,
        inputs: &[PathBuf],
        output: &Path,
    ) -> HarvestResult<()>;
}

/// `llvm-profdata merge`
#[derive(Debug)]
pub struct LlvmProfdata {
    resolver: ToolResolver,
    failure_mode: Option<String>,
}

impl LlvmProfdata {
    /// Merge through the resolved `llvm-profdata`
    #[must_use]
    pub fn new(resolver: ToolResolver) -> Self {
        Self {
            resolver,
            failure_mode: None,
        }
    }

    /// Pass `--failure-mode=<mode>`
    #[must_use]
    pub fn with_failure_mode(mut self, mode: Option<String>) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Full argv for one merge
    #[must_use]
    pub fn merge_args(&self, program: &str, inputs: &[PathBuf], output: &Path) -> Vec<String> {
        let mut args = vec![
            program.to_string(),
            "merge".to_string(),
            "--num-threads=0".to_string(),
            "-sparse".to_string(),
        ];
        if let Some(ref mode) = self.failure_mode {
            args.push(format!("--failure-mode={mode}"));
        }
        args.push("-o".to_string());
        args.push(path_arg(output));
        args.extend(inputs.iter().map(|p| path_arg(p)));
        args
    }
}

#[async_trait]
impl MergeTool for LlvmProfdata {
    async fn prepare(&self, sandbox: &dyn Sandbox, handle: &SandboxHandle) -> HarvestResult<()> {
        self.resolver.resolve(sandbox, handle).await.map(|_| ())
    }

    async fn merge(
        &self,
        sandbox: &dyn Sandbox,
        handle: &SandboxHandle,
        inputs: &[PathBuf],
        output: &Path,
    ) -> HarvestResult<()> {
        let program = self.resolver.resolve(sandbox, handle).await?;
        let request = ExecRequest::new(self.merge_args(program, inputs, output));
        debug!(inputs = inputs.len(), output = %output.display(), "llvm-profdata merge");
        let result = sandbox.exec(handle, &request).await?;
        if !result.success() {
            return Err(HarvestError::merge(format!(
                "llvm-profdata exited with {:?}: {}",
                result.exit_code,
                result.stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Merge operations bound to one sandbox
#[derive(Debug, Clone, Copy)]
pub struct ProfileMerger<'a> {
    sandbox: &'a dyn Sandbox,
    handle: &'a SandboxHandle,
    tool: &'a dyn MergeTool,
}

impl<'a> ProfileMerger<'a> {
    /// Bind a merge tool to a sandbox handle
    #[must_use]
    pub fn new(
        sandbox: &'a dyn Sandbox,
        handle: &'a SandboxHandle,
        tool: &'a dyn MergeTool,
    ) -> Self {
        Self {
            sandbox,
            handle,
            tool,
        }
    }

    /// Merge arbitrary sandbox artifacts into `output`
    pub async fn merge(&self, inputs: &[PathBuf], output: &Path) -> HarvestResult<()> {
        if inputs.is_empty() {
            return Err(HarvestError::merge("Nothing to merge"));
        }
        if let Some(parent) = output.parent() {
            self.sandbox.make_dir(self.handle, parent).await?;
        }
        self.tool.merge(self.sandbox, self.handle, inputs, output).await
    }

    /// Merge every raw profile below `raw_root` into `output`, then drop the
    /// raw profiles. Returns how many were merged.
    pub async fn merge_bucket(&self, raw_root: &Path, output: &Path) -> HarvestResult<usize> {
        let raws = self
            .sandbox
            .find_files(self.handle, raw_root, RAW_PROFILE_SUFFIX)
            .await?;
        if raws.is_empty() {
            return Err(HarvestError::merge(format!(
                "No {RAW_PROFILE_SUFFIX} files generated under {}",
                raw_root.display()
            )));
        }
        info!(count = raws.len(), output = %output.display(), "merging raw profiles");
        self.merge(&raws, output).await?;
        if let Err(e) = self.sandbox.remove(self.handle, raw_root).await {
            warn!(error = %e, "failed to clean up raw profiles");
        }
        Ok(raws.len())
    }
}

// ============================================================================
// Cumulative profile
// ============================================================================

/// The running merge of every bucket folded so far
#[derive(Debug)]
pub struct CumulativeProfile {
    host_path: PathBuf,
    sandbox_dir: PathBuf,
    folded: Vec<BucketLabel>,
}

impl CumulativeProfile {
    /// Cumulative profile stored at `host_path`, merged inside `sandbox_dir`
    #[must_use]
    pub fn new(host_path: impl Into<PathBuf>, sandbox_dir: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host_path.into(),
            sandbox_dir: sandbox_dir.into(),
            folded: Vec::new(),
        }
    }

    /// Durable location on the host
    #[must_use]
    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    /// Current copy inside the sandbox, valid after a fold
    #[must_use]
    pub fn sandbox_path(&self) -> PathBuf {
        self.sandbox_dir.join("cumulative.profdata")
    }

    /// Labels folded in this run, in order
    #[must_use]
    pub fn folded(&self) -> &[BucketLabel] {
        &self.folded
    }

    /// Whether a cumulative artifact exists yet
    #[must_use]
    pub fn exists(&self) -> bool {
        self.host_path.is_file()
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .host_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.host_path.with_file_name(name)
    }

    /// Discard any cumulative state left by an earlier run
    pub fn reset(&mut self) -> HarvestResult<()> {
        for path in [self.host_path.clone(), self.temp_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed stale cumulative profile"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.folded.clear();
        Ok(())
    }

    /// Fold one bucket profile (a host file) into the running state.
    ///
    /// The first fold copies; later folds merge in the sandbox and replace
    /// the host file by rename only after the merge succeeded.
    pub async fn fold(
        &mut self,
        merger: &ProfileMerger<'_>,
        label: BucketLabel,
        bucket_profile: &Path,
    ) -> HarvestResult<()> {
        if !bucket_profile.is_file() {
            return Err(HarvestError::merge(format!(
                "Bucket profile missing: {}",
                bucket_profile.display()
            )));
        }
        if let Some(parent) = self.host_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.temp_path();

        if self.exists() {
            let current = self.sandbox_path();
            let incoming = self.sandbox_dir.join(format!("bucket-{label}.profdata"));
            let next = self.sandbox_dir.join("cumulative.next.profdata");
            merger
                .sandbox
                .copy_in(merger.handle, &self.host_path, &current)
                .await?;
            merger
                .sandbox
                .copy_in(merger.handle, bucket_profile, &incoming)
                .await?;
            merger.merge(&[current, incoming.clone()], &next).await?;
            merger
                .sandbox
                .copy_out(merger.handle, &next, &tmp)
                .await?;
            for scratch in [&incoming, &next] {
                if let Err(e) = merger.sandbox.remove(merger.handle, scratch).await {
                    warn!(error = %e, "failed to remove merge scratch file");
                }
            }
            info!(label = %label, "folded bucket into cumulative profile");
        } else {
            std::fs::copy(bucket_profile, &tmp)?;
            info!(label = %label, "seeded cumulative profile");
        }
        std::fs::rename(&tmp, &self.host_path)?;

        merger
            .sandbox
            .copy_in(merger.handle, &self.host_path, &self.sandbox_path())
            .await?;
        self.folded.push(label);
        Ok(())
    }
}
