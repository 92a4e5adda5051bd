//! Error types for covharvest
//!
//! Every failure maps onto one of five kinds. Input and resource failures
//! end the run; run failures are tallied per unit; merge failures end one
//! bucket; report failures only produce a warning.

use std::fmt;
use thiserror::Error;

/// Result type for harvesting operations
pub type HarvestResult<T> = Result<T, HarvestError>;

/// Errors that can occur while harvesting coverage
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Bad directory, non-positive interval, missing collaborator artifact
    #[error("Input error: {message}")]
    Input {
        /// Error message
        message: String,
    },

    /// A single unit of work failed (never escapes the batch executor)
    #[error("Run failed for {unit}: {message}")]
    RunFailure {
        /// Unit that failed
        unit: String,
        /// Error message
        message: String,
    },

    /// Profile merge failed or had nothing to merge
    #[error("Merge failed: {message}")]
    Merge {
        /// Error message
        message: String,
    },

    /// Coverage report could not be rendered or parsed
    #[error("Report failed: {message}")]
    Report {
        /// Error message
        message: String,
    },

    /// Sandbox provisioning, copying or teardown failed
    #[error("Sandbox error: {message}")]
    Resource {
        /// Error message
        message: String,
    },

    /// No candidate tool could be resolved
    #[error("No usable {tool} found (tried: {tried})")]
    ToolNotFound {
        /// Logical tool name
        tool: String,
        /// Comma separated candidates that were probed
        tried: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// The run was interrupted by the user
    #[error("Interrupted")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure taxonomy used by the pipeline driver to decide what to abort
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal before any sandbox work
    Input,
    /// Recorded and tallied, never aborts a batch
    Run,
    /// Fatal to one bucket
    Merge,
    /// Degrades to a warning
    Report,
    /// Fatal to the whole run
    Resource,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Run => write!(f, "run"),
            Self::Merge => write!(f, "merge"),
            Self::Report => write!(f, "report"),
            Self::Resource => write!(f, "resource"),
        }
    }
}

impl HarvestError {
    /// Create an input error
    #[must_use]
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
        }
    }

    /// Create a run failure for one unit
    #[must_use]
    pub fn run_failure(unit: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RunFailure {
            unit: unit.into(),
            message: message.into(),
        }
    }

    /// Create a merge error
    #[must_use]
    pub fn merge(message: impl Into<String>) -> Self {
        Self::Merge {
            message: message.into(),
        }
    }

    /// Create a report error
    #[must_use]
    pub fn report(message: impl Into<String>) -> Self {
        Self::Report {
            message: message.into(),
        }
    }

    /// Create a sandbox resource error
    #[must_use]
    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Input { .. } | Self::ToolNotFound { .. } | Self::Config { .. } | Self::Yaml(_) => {
                ErrorKind::Input
            }
            Self::RunFailure { .. } => ErrorKind::Run,
            Self::Merge { .. } => ErrorKind::Merge,
            Self::Report { .. } => ErrorKind::Report,
            Self::Resource { .. } | Self::Cancelled | Self::Io(_) | Self::Json(_) => {
                ErrorKind::Resource
            }
        }
    }

    /// Whether this error must stop the whole pipeline run
    #[must_use]
    pub const fn is_fatal_to_run(&self) -> bool {
        matches!(self.kind(), ErrorKind::Input | ErrorKind::Resource)
    }
}
