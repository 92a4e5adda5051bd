//! covharvest CLI library
//!
//! Command definitions, terminal output and logging for the `covharvest`
//! binary. The pipeline itself lives in the `covharvest` crate.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod commands;
mod config;
mod error;
pub mod handlers;
pub mod logging;
mod output;

pub use commands::{
    split_command, ClassifyArgs, Cli, ColorArg, Commands, ExtractArgs, ParserArg, RunArgs,
    SandboxArg, UnitModeArg,
};
pub use config::{CliConfig, ColorChoice, Verbosity};
pub use error::{CliError, CliResult};
pub use output::ProgressReporter;
