//! covharvest: batch coverage harvesting for instrumented native libraries
//!
//! Replays corpora of generated test programs inside an instrumented
//! sandbox, one time bucket at a time, and accumulates LLVM coverage
//! across buckets.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────────────────┐   ┌──────────┐   ┌───────────┐
//! │ Bucketizer│──►│ BatchExecutor                │──►│ Profile  │──►│ Coverage  │
//! │ (mtime    │   │  └ IsolatedRunner x N        │   │ Merger   │   │ Extractor │
//! │  buckets) │   │     (sandbox, timeout, env)  │   │ (+cumul.)│   │ (filter)  │
//! └───────────┘   └──────────────────────────────┘   └──────────┘   └───────────┘
//!        ▲                                                                │
//!        └──────────────────── Pipeline (per bucket, in order) ◄──────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use covharvest::{HarvestConfig, Pipeline};
//!
//! # async fn run() -> covharvest::HarvestResult<()> {
//! let config = HarvestConfig::new()
//!     .with_target("corpus/acetest")
//!     .with_baseline("acetest");
//! let summary = Pipeline::from_config(config)?.run().await?;
//! print!("{}", summary.render_table());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::large_stack_arrays, clippy::large_stack_frames))]

pub mod bucket;
pub mod config;
pub mod coverage;
pub mod executor;
pub mod layout;
pub mod merge;
pub mod pipeline;
mod result;
pub mod runner;
pub mod sandbox;
pub mod tools;

pub use bucket::{BucketKey, BucketLabel, Bucketizer, Classification};
pub use config::{
    HarvestConfig, Library, ParserPreference, ReportConfig, SandboxConfig, SandboxKind,
    ToolsConfig, UnitMode,
};
pub use coverage::{CoverageExtractor, CoverageReport, CoverageScore, FileCoverage};
pub use executor::{BatchExecutor, BatchReport, BatchTally};
pub use layout::{ArtifactLayout, SandboxLayout};
pub use merge::{CumulativeProfile, LlvmProfdata, MergeTool, ProfileMerger};
pub use pipeline::{
    BucketRecord, BucketState, NoopObserver, Pipeline, PipelineObserver, PipelineSummary,
};
pub use result::{ErrorKind, HarvestError, HarvestResult};
pub use runner::{IsolatedRunner, RunOutcome, RunStatus, RunnerConfig, Shutdown, WorkUnit};
pub use sandbox::{ExecOutput, ExecRequest, Sandbox, SandboxHandle};
