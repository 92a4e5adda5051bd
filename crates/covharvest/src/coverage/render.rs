//! Rendering a merged profile into a human-readable report

use crate::result::{HarvestError, HarvestResult};
use crate::sandbox::{path_arg, ExecRequest, Sandbox, SandboxHandle};
use crate::tools::ToolResolver;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Index document written by `llvm-cov show -format=html`
pub const INDEX_FILE: &str = "index.html";

/// Renders a profile against a reference binary inside the sandbox
#[async_trait]
pub trait ReportRenderer: Send + Sync + fmt::Debug {
    /// Resolve anything the renderer needs before the first render
    async fn prepare(&self, _sandbox: &dyn Sandbox, _handle: &SandboxHandle) -> HarvestResult<()> {
        Ok(())
    }

    /// Render `profile` into `output_dir`; returns the sandbox path of the
    /// document the extractor should read
    async fn render(
        &self,
        sandbox: &dyn Sandbox,
        handle: &SandboxHandle,
        profile: &Path,
        output_dir: &Path,
    ) -> HarvestResult<PathBuf>;
}

/// `llvm-cov show -format=html`
#[derive(Debug)]
pub struct LlvmCovHtml {
    resolver: ToolResolver,
    binary: PathBuf,
    ignore_filename_regex: Option<String>,
}

impl LlvmCovHtml {
    /// Render through the resolved `llvm-cov` against `binary`
    #[must_use]
    pub fn new(resolver: ToolResolver, binary: impl Into<PathBuf>) -> Self {
        Self {
            resolver,
            binary: binary.into(),
            ignore_filename_regex: None,
        }
    }

    /// Exclude matching files from the report
    #[must_use]
    pub fn with_ignore_filename_regex(mut self, regex: Option<String>) -> Self {
        self.ignore_filename_regex = regex;
        self
    }

    /// Full argv for one render
    #[must_use]
    pub fn show_args(&self, program: &str, profile: &Path, output_dir: &Path) -> Vec<String> {
        let mut args = vec![
            program.to_string(),
            "show".to_string(),
            "-format=html".to_string(),
            format!("-instr-profile={}", path_arg(profile)),
            format!("-output-dir={}", path_arg(output_dir)),
        ];
        if let Some(ref regex) = self.ignore_filename_regex {
            args.push(format!("-ignore-filename-regex={regex}"));
        }
        args.push(path_arg(&self.binary));
        args
    }
}

#[async_trait]
impl ReportRenderer for LlvmCovHtml {
    async fn prepare(&self, sandbox: &dyn Sandbox, handle: &SandboxHandle) -> HarvestResult<()> {
        self.resolver.resolve(sandbox, handle).await.map(|_| ())
    }

    async fn render(
        &self,
        sandbox: &dyn Sandbox,
        handle: &SandboxHandle,
        profile: &Path,
        output_dir: &Path,
    ) -> HarvestResult<PathBuf> {
        let program = self.resolver.resolve(sandbox, handle).await?;
        sandbox.remove(handle, output_dir).await?;
        let request = ExecRequest::new(self.show_args(program, profile, output_dir));
        debug!(command = %request.rendered(), "llvm-cov show");
        let output = sandbox.exec(handle, &request).await?;
        if !output.success() {
            return Err(HarvestError::report(format!(
                "llvm-cov exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        let index = output_dir.join(INDEX_FILE);
        if !sandbox.file_exists(handle, &index).await? {
            return Err(HarvestError::report(format!(
                "llvm-cov produced no {}",
                index.display()
            )));
        }
        Ok(index)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sandbox::LocalSandbox;
    use tempfile::TempDir;

    #[test]
    fn test_show_args() {
        let renderer = LlvmCovHtml::new(
            ToolResolver::fixed("llvm-cov", "llvm-cov-18"),
            "/usr/lib/libtorch_cpu.so",
        )
        .with_ignore_filename_regex(Some("third_party".to_string()));
        let args = renderer.show_args(
            "llvm-cov-18",
            Path::new("/root/cumulative/cumulative.profdata"),
            Path::new("/root/report/0-60"),
        );
        assert_eq!(
            args,
            vec![
                "llvm-cov-18",
                "show",
                "-format=html",
                "-instr-profile=/root/cumulative/cumulative.profdata",
                "-output-dir=/root/report/0-60",
                "-ignore-filename-regex=third_party",
                "/usr/lib/libtorch_cpu.so",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_render_is_report_error() {
        let dir = TempDir::new().unwrap();
        let sb = LocalSandbox::new(dir.path());
        let handle = sb.provision().await.unwrap();
        let renderer = LlvmCovHtml::new(ToolResolver::fixed("llvm-cov", "false"), "/bin/true");
        let err = renderer
            .render(&sb, &handle, Path::new("p"), &dir.path().join("report"))
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Report { .. }));
    }

    #[tokio::test]
    async fn test_missing_index_is_report_error() {
        let dir = TempDir::new().unwrap();
        let sb = LocalSandbox::new(dir.path());
        let handle = sb.provision().await.unwrap();
        let renderer = LlvmCovHtml::new(ToolResolver::fixed("llvm-cov", "true"), "/bin/true");
        let err = renderer
            .render(&sb, &handle, Path::new("p"), &dir.path().join("report"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("index.html"));
    }
}
