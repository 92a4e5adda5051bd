//! CLI command definitions using clap

use crate::error::CliResult;
use clap::{Parser, Subcommand, ValueEnum};
use covharvest::config::INPUT_PLACEHOLDER;
use covharvest::{HarvestConfig, Library, ParserPreference, SandboxKind, UnitMode};
use std::path::PathBuf;

/// covharvest: replay generated test programs and accumulate LLVM coverage
/// bucket by bucket
#[derive(Parser, Debug)]
#[command(name = "covharvest")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Color output (auto, always, never)
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorArg,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full pipeline: classify, execute, merge and report every bucket
    Run(RunArgs),

    /// Sort a corpus into time buckets without running anything
    Classify(ClassifyArgs),

    /// Extract per-file line coverage from a rendered report
    Extract(ExtractArgs),
}

/// Arguments for the run command
#[derive(Parser, Debug, Default)]
pub struct RunArgs {
    /// Directory of generated programs, or of already classified buckets
    pub target: Option<PathBuf>,

    /// YAML configuration file; flags override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Root for classified inputs and artifacts
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Baseline name (defaults to the target directory name)
    #[arg(short, long)]
    pub baseline: Option<String>,

    /// Bucket width in seconds
    #[arg(short, long, allow_negative_numbers = true)]
    pub interval: Option<i64>,

    /// Concurrent units per bucket (0 = available parallelism)
    #[arg(short = 'j', long)]
    pub workers: Option<usize>,

    /// Per-unit timeout in seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Only classify files whose relative path matches this regex
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Source extension to recognise (repeatable)
    #[arg(long = "ext")]
    pub extensions: Vec<String>,

    /// Unit granularity
    #[arg(long)]
    pub unit_mode: Option<UnitModeArg>,

    /// Command template; `{input}` is replaced with the unit path
    #[arg(long)]
    pub command: Option<String>,

    /// Instrumented library (torch, tf)
    #[arg(long)]
    pub dll: Option<String>,

    /// Library version
    #[arg(long)]
    pub ver: Option<String>,

    /// Sandbox implementation
    #[arg(long)]
    pub sandbox: Option<SandboxArg>,

    /// Explicit sandbox image
    #[arg(long)]
    pub image: Option<String>,

    /// Instrumented binary the report is rendered against
    #[arg(long)]
    pub reference_binary: Option<PathBuf>,

    /// Only count files whose path contains this substring (repeatable)
    #[arg(long = "require")]
    pub required: Vec<String>,

    /// Report parser
    #[arg(long)]
    pub parser: Option<ParserArg>,

    /// llvm-profdata `--failure-mode`
    #[arg(long)]
    pub failure_mode: Option<String>,
}

impl RunArgs {
    /// Resolve the harvest configuration: file (if any), then flags
    pub fn resolve(&self) -> CliResult<HarvestConfig> {
        let base = match self.config {
            Some(ref path) => HarvestConfig::from_yaml_file(path)?,
            None => HarvestConfig::new(),
        };
        self.apply(base)
    }

    /// Override `config` with every flag that was given
    pub fn apply(&self, mut config: HarvestConfig) -> CliResult<HarvestConfig> {
        if let Some(ref target) = self.target {
            config.target = target.clone();
        }
        if let Some(ref output) = self.output {
            config.output_root = output.clone();
        }
        if let Some(ref baseline) = self.baseline {
            config.baseline = baseline.clone();
        }
        if config.baseline.trim().is_empty() {
            if let Some(name) = config.target.file_name() {
                config.baseline = name.to_string_lossy().into_owned();
            }
        }
        if let Some(interval) = self.interval {
            config.interval_secs = interval;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = timeout;
        }
        if self.filter.is_some() {
            config.filter = self.filter.clone();
        }
        if !self.extensions.is_empty() {
            config.source_extensions = self.extensions.clone();
        }
        if let Some(mode) = self.unit_mode {
            config.unit_mode = mode.into();
        }
        if let Some(ref command) = self.command {
            config.command = split_command(command);
        }
        if let Some(ref dll) = self.dll {
            config.sandbox.library = Library::parse(dll)?;
        }
        if let Some(ref ver) = self.ver {
            config.sandbox.version = ver.clone();
        }
        if let Some(kind) = self.sandbox {
            config.sandbox.kind = kind.into();
        }
        if self.image.is_some() {
            config.sandbox.image = self.image.clone();
        }
        if self.reference_binary.is_some() {
            config.report.reference_binary = self.reference_binary.clone();
        }
        if !self.required.is_empty() {
            config.required_substrings = self.required.clone();
        }
        if let Some(parser) = self.parser {
            config.report.parser = parser.into();
        }
        if self.failure_mode.is_some() {
            config.tools.merge_failure_mode = self.failure_mode.clone();
        }
        Ok(config)
    }
}

/// Whitespace-split a command template, keeping `{input}` as its own word
#[must_use]
pub fn split_command(command: &str) -> Vec<String> {
    let mut words: Vec<String> = command.split_whitespace().map(String::from).collect();
    if !words.iter().any(|w| w.contains(INPUT_PLACEHOLDER)) {
        words.push(INPUT_PLACEHOLDER.to_string());
    }
    words
}

/// Arguments for the classify command
#[derive(Parser, Debug)]
pub struct ClassifyArgs {
    /// Directory of generated programs
    pub target: PathBuf,

    /// Where bucket directories are written (default: `<target>-buckets`)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Bucket width in seconds
    #[arg(short, long, default_value = "60", allow_negative_numbers = true)]
    pub interval: i64,

    /// Only classify files whose relative path matches this regex
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Source extension to recognise (repeatable)
    #[arg(long = "ext", default_value = "py")]
    pub extensions: Vec<String>,
}

impl ClassifyArgs {
    /// Output directory, defaulting to a sibling of the target
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            let name = self
                .target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "target".to_string());
            self.target.with_file_name(format!("{name}-buckets"))
        })
    }
}

/// Arguments for the extract command
#[derive(Parser, Debug)]
pub struct ExtractArgs {
    /// Rendered report (llvm-cov `index.html`)
    pub report: PathBuf,

    /// Only count files whose path contains this substring (repeatable)
    #[arg(long = "require")]
    pub required: Vec<String>,

    /// Report parser
    #[arg(long, default_value = "auto")]
    pub parser: ParserArg,

    /// Emit JSON instead of the text summary
    #[arg(long)]
    pub json: bool,
}

/// Unit granularity
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnitModeArg {
    /// One unit per source file
    #[default]
    File,
    /// One unit per immediate subdirectory
    Subdir,
}

impl From<UnitModeArg> for UnitMode {
    fn from(arg: UnitModeArg) -> Self {
        match arg {
            UnitModeArg::File => Self::File,
            UnitModeArg::Subdir => Self::Subdir,
        }
    }
}

/// Sandbox implementation
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SandboxArg {
    /// Docker container from the instrumented image
    #[default]
    Docker,
    /// Host processes
    Local,
}

impl From<SandboxArg> for SandboxKind {
    fn from(arg: SandboxArg) -> Self {
        match arg {
            SandboxArg::Docker => Self::Docker,
            SandboxArg::Local => Self::Local,
        }
    }
}

/// Report parser choice
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParserArg {
    /// Table when present, pattern matching otherwise
    #[default]
    Auto,
    /// Structured table only
    Table,
    /// Path/figure pattern matching only
    Pattern,
}

impl From<ParserArg> for ParserPreference {
    fn from(arg: ParserArg) -> Self {
        match arg {
            ParserArg::Auto => Self::Auto,
            ParserArg::Table => Self::Table,
            ParserArg::Pattern => Self::Pattern,
        }
    }
}

/// Color output argument
#[derive(ValueEnum, Clone, Debug, Default)]
pub enum ColorArg {
    /// Automatic color detection
    #[default]
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

impl From<ColorArg> for crate::config::ColorChoice {
    fn from(arg: ColorArg) -> Self {
        match arg {
            ColorArg::Auto => Self::Auto,
            ColorArg::Always => Self::Always,
            ColorArg::Never => Self::Never,
        }
    }
}
