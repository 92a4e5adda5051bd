//! Harvest configuration
//!
//! A run is described by one [`HarvestConfig`]. It can be loaded from YAML
//! and then overridden field by field with the `with_*` builders.

use crate::result::{HarvestError, HarvestResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder substituted with the unit path in [`HarvestConfig::command`]
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// Instrumented library the sandbox image was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Library {
    /// PyTorch
    #[default]
    Torch,
    /// TensorFlow
    Tf,
}

impl Library {
    /// Parse a library name (case-insensitive, surrounding whitespace ignored)
    pub fn parse(value: &str) -> HarvestResult<Self> {
        match value.trim().to_lowercase().as_str() {
            "torch" => Ok(Self::Torch),
            "tf" => Ok(Self::Tf),
            _ => Err(HarvestError::input(format!(
                "Unsupported library '{value}'. Supported: tf, torch"
            ))),
        }
    }

    /// Instrumented image name for a given library version
    #[must_use]
    pub fn image_name(self, version: &str) -> String {
        format!("ncsu-swat/{self}-{version}-instrumented")
    }

    /// Container name for a given version and baseline
    #[must_use]
    pub fn container_name(self, version: &str, baseline: &str) -> String {
        if baseline.is_empty() {
            format!("{self}_cov_{version}")
        } else {
            format!("{self}_cov_{version}-{baseline}")
        }
    }
}

impl fmt::Display for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Torch => write!(f, "torch"),
            Self::Tf => write!(f, "tf"),
        }
    }
}

/// Which sandbox implementation runs the units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// A Docker container started from the instrumented image
    #[default]
    Docker,
    /// Plain host processes under a scratch directory
    Local,
}

/// How a bucket is split into units of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitMode {
    /// Every recognised source file is one unit
    #[default]
    File,
    /// Every immediate subdirectory of the bucket is one unit
    Subdir,
}

/// Which coverage report parser to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserPreference {
    /// Table parser when the report has the table, pattern matching otherwise
    #[default]
    Auto,
    /// Only the structured table parser
    Table,
    /// Only the path/figure pattern matcher
    Pattern,
}

/// Sandbox configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Implementation
    pub kind: SandboxKind,
    /// Instrumented library
    pub library: Library,
    /// Library version (e.g. `2.2.0`)
    pub version: String,
    /// Explicit image; derived from library and version when unset
    pub image: Option<String>,
    /// Explicit container name; derived when unset
    pub container_name: Option<String>,
    /// Root directory inside the sandbox
    pub work_root: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            kind: SandboxKind::Docker,
            library: Library::Torch,
            version: "2.2.0".to_string(),
            image: None,
            container_name: None,
            work_root: PathBuf::from("/root"),
        }
    }
}

impl SandboxConfig {
    /// Image to start
    #[must_use]
    pub fn resolved_image(&self) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| self.library.image_name(&self.version))
    }

    /// Container name to use for a baseline
    #[must_use]
    pub fn resolved_container_name(&self, baseline: &str) -> String {
        self.container_name
            .clone()
            .unwrap_or_else(|| self.library.container_name(&self.version, baseline))
    }
}

/// Candidate tool names probed once at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Candidates for `llvm-profdata`, in probe order
    pub profdata_candidates: Vec<String>,
    /// Candidates for `llvm-cov`, in probe order
    pub cov_candidates: Vec<String>,
    /// Value for `--failure-mode=` on merges
    pub merge_failure_mode: Option<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            profdata_candidates: candidates_with_env(
                "LLVM_PROFDATA",
                &["llvm-profdata", "llvm-profdata-18", "llvm-profdata-17"],
            ),
            cov_candidates: candidates_with_env(
                "LLVM_COV",
                &["llvm-cov", "llvm-cov-18", "llvm-cov-17"],
            ),
            merge_failure_mode: None,
        }
    }
}

fn candidates_with_env(var: &str, names: &[&str]) -> Vec<String> {
    let mut candidates = Vec::with_capacity(names.len() + 1);
    if let Ok(value) = std::env::var(var) {
        if !value.trim().is_empty() {
            candidates.push(value);
        }
    }
    candidates.extend(names.iter().map(|n| (*n).to_string()));
    candidates
}

/// Coverage report configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Instrumented reference binary inside the sandbox
    pub reference_binary: Option<PathBuf>,
    /// Parser strategy
    pub parser: ParserPreference,
    /// Passed to `llvm-cov show -ignore-filename-regex=`
    pub ignore_filename_regex: Option<String>,
}

/// Configuration for one harvesting run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Directory of generated programs (or of already classified buckets)
    pub target: PathBuf,
    /// Root for classified inputs and durable artifacts
    pub output_root: PathBuf,
    /// Baseline name (namespaces all artifacts)
    pub baseline: String,
    /// Bucket width in seconds
    pub interval_secs: i64,
    /// Worker bound (0 = available parallelism)
    pub workers: usize,
    /// Per-unit wall-clock timeout in seconds
    pub timeout_secs: u64,
    /// Optional regex applied to paths relative to the target
    pub filter: Option<String>,
    /// Recognised source extensions (without the dot)
    pub source_extensions: Vec<String>,
    /// Unit granularity
    pub unit_mode: UnitMode,
    /// Command template; `{input}` is replaced with the unit path
    pub command: Vec<String>,
    /// Reported paths must contain every one of these
    pub required_substrings: Vec<String>,
    /// Sandbox settings
    pub sandbox: SandboxConfig,
    /// Tool discovery settings
    pub tools: ToolsConfig,
    /// Report settings
    pub report: ReportConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            target: PathBuf::new(),
            output_root: PathBuf::from("_result"),
            baseline: String::new(),
            interval_secs: 60,
            workers: 0,
            timeout_secs: 30,
            filter: None,
            source_extensions: vec!["py".to_string()],
            unit_mode: UnitMode::File,
            command: vec!["python".to_string(), INPUT_PLACEHOLDER.to_string()],
            required_substrings: Vec::new(),
            sandbox: SandboxConfig::default(),
            tools: ToolsConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl HarvestConfig {
    /// Create new default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> HarvestResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HarvestError::input(format!("Cannot read config {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(content: &str) -> HarvestResult<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    /// Set target directory
    #[must_use]
    pub fn with_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = target.into();
        self
    }

    /// Set output root
    #[must_use]
    pub fn with_output_root(mut self, output_root: impl Into<PathBuf>) -> Self {
        self.output_root = output_root.into();
        self
    }

    /// Set baseline name
    #[must_use]
    pub fn with_baseline(mut self, baseline: impl Into<String>) -> Self {
        self.baseline = baseline.into();
        self
    }

    /// Set bucket interval in seconds
    #[must_use]
    pub const fn with_interval_secs(mut self, interval_secs: i64) -> Self {
        self.interval_secs = interval_secs;
        self
    }

    /// Set worker bound
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set per-unit timeout in seconds
    #[must_use]
    pub const fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Set path filter
    #[must_use]
    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter;
        self
    }

    /// Set unit mode
    #[must_use]
    pub const fn with_unit_mode(mut self, unit_mode: UnitMode) -> Self {
        self.unit_mode = unit_mode;
        self
    }

    /// Set command template
    #[must_use]
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Set required path substrings
    #[must_use]
    pub fn with_required_substrings(mut self, required: Vec<String>) -> Self {
        self.required_substrings = required;
        self
    }

    /// Set sandbox configuration
    #[must_use]
    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Set report configuration
    #[must_use]
    pub fn with_report(mut self, report: ReportConfig) -> Self {
        self.report = report;
        self
    }

    /// Per-unit timeout
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Get effective number of workers
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        } else {
            self.workers
        }
    }

    /// Reject configurations that cannot produce a meaningful run
    pub fn validate(&self) -> HarvestResult<()> {
        if self.baseline.trim().is_empty() {
            return Err(HarvestError::input("Baseline name must not be empty"));
        }
        if self.interval_secs <= 0 {
            return Err(HarvestError::input(format!(
                "Interval must be a positive number of seconds, got: {}",
                self.interval_secs
            )));
        }
        if self.timeout_secs == 0 {
            return Err(HarvestError::input("Timeout must be at least one second"));
        }
        if !self.command.iter().any(|arg| arg.contains(INPUT_PLACEHOLDER)) {
            return Err(HarvestError::input(format!(
                "Command template must contain {INPUT_PLACEHOLDER}"
            )));
        }
        if self.source_extensions.is_empty() {
            return Err(HarvestError::input("At least one source extension is required"));
        }
        if !self.target.is_dir() {
            return Err(HarvestError::input(format!(
                "Target directory does not exist: {}",
                self.target.display()
            )));
        }
        Ok(())
    }
}
