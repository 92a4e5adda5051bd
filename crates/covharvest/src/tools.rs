//! Tool discovery
//!
//! LLVM tools ship under versioned names depending on the image. Each
//! [`ToolResolver`] probes its candidates once, inside the sandbox, and
//! remembers the first one that answers `--version`.

use crate::config::ToolsConfig;
use crate::result::{HarvestError, HarvestResult};
use crate::sandbox::{ExecRequest, Sandbox, SandboxHandle};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Memoized lookup of one external tool
#[derive(Debug)]
pub struct ToolResolver {
    tool: String,
    candidates: Vec<String>,
    resolved: OnceCell<String>,
}

impl ToolResolver {
    /// Resolver for `tool` probing `candidates` in order
    #[must_use]
    pub fn new(tool: impl Into<String>, candidates: Vec<String>) -> Self {
        Self {
            tool: tool.into(),
            candidates,
            resolved: OnceCell::new(),
        }
    }

    /// Resolver that skips probing and always answers `program`
    #[must_use]
    pub fn fixed(tool: impl Into<String>, program: impl Into<String>) -> Self {
        let program = program.into();
        Self {
            tool: tool.into(),
            candidates: vec![program.clone()],
            resolved: OnceCell::new_with(Some(program)),
        }
    }

    /// Logical tool name
    #[must_use]
    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Candidates in probe order
    #[must_use]
    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Resolved program, if probing already happened
    #[must_use]
    pub fn get(&self) -> Option<&str> {
        self.resolved.get().map(String::as_str)
    }

    /// Resolve the tool, probing at most once per resolver
    pub async fn resolve(
        &self,
        sandbox: &dyn Sandbox,
        handle: &SandboxHandle,
    ) -> HarvestResult<&str> {
        let program = self
            .resolved
            .get_or_try_init(|| self.probe(sandbox, handle))
            .await?;
        Ok(program.as_str())
    }

    async fn probe(&self, sandbox: &dyn Sandbox, handle: &SandboxHandle) -> HarvestResult<String> {
        for candidate in &self.candidates {
            let request = ExecRequest::new([candidate.as_str(), "--version"]);
            match sandbox.exec(handle, &request).await {
                Ok(output) if output.success() => {
                    info!(tool = %self.tool, program = %candidate, "Resolved tool");
                    return Ok(candidate.clone());
                }
                Ok(output) => {
                    debug!(candidate = %candidate, code = ?output.exit_code, "Tool probe failed");
                }
                Err(e) => debug!(candidate = %candidate, error = %e, "Tool probe failed"),
            }
        }
        Err(HarvestError::ToolNotFound {
            tool: self.tool.clone(),
            tried: self.candidates.join(", "),
        })
    }
}

/// The tools one pipeline run needs
#[derive(Debug)]
pub struct Toolchain {
    /// Profile merger
    pub profdata: ToolResolver,
    /// Report renderer
    pub cov: ToolResolver,
}

impl Toolchain {
    /// Build resolvers from configuration
    #[must_use]
    pub fn from_config(config: &ToolsConfig) -> Self {
        Self {
            profdata: ToolResolver::new("llvm-profdata", config.profdata_candidates.clone()),
            cov: ToolResolver::new("llvm-cov", config.cov_candidates.clone()),
        }
    }
}
