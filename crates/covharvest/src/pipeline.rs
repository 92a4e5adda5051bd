//! Pipeline Driver
//!
//! Provisions the sandbox once, walks the buckets in ascending numeric label
//! order and drives each one through
//! `pending -> (resumed | executed) -> merged -> reported -> done`.
//! A failing bucket is recorded and the next one is attempted; teardown
//! runs however the loop ends.

use crate::bucket::{is_classified, list_buckets, BucketLabel, Bucketizer};
use crate::config::{HarvestConfig, SandboxKind};
use crate::coverage::{CoverageExtractor, CoverageScore, LlvmCovHtml, ReportRenderer};
use crate::executor::{discover_units, BatchExecutor, BatchTally};
use crate::layout::{ArtifactLayout, SandboxLayout};
use crate::merge::{CumulativeProfile, LlvmProfdata, MergeTool, ProfileMerger};
use crate::result::{HarvestError, HarvestResult};
use crate::runner::{IsolatedRunner, RunOutcome, RunnerConfig, Shutdown};
use crate::sandbox::{DockerSandbox, LocalSandbox, Sandbox, SandboxHandle};
use crate::tools::Toolchain;
use serde::Serialize;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

// ============================================================================
// Bucket state machine
// ============================================================================

/// Where a bucket is in its processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketState {
    /// Not started
    Pending,
    /// Bucket profile reused from an earlier run
    Resumed,
    /// Units executed and bucket profile persisted
    Executed,
    /// Folded into the cumulative profile
    Merged,
    /// Report extracted
    Reported,
    /// Report step failed; the bucket still counts as processed
    ReportedWithWarning,
    /// Finished
    Done,
    /// Hard failure
    Failed,
    /// Stopped by an interrupt
    Cancelled,
}

impl fmt::Display for BucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Resumed => "resumed",
            Self::Executed => "executed",
            Self::Merged => "merged",
            Self::Reported => "reported",
            Self::ReportedWithWarning => "reported-with-warning",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Everything that happened to one bucket
#[derive(Debug, Clone, Serialize)]
pub struct BucketRecord {
    /// Bucket label
    pub label: String,
    /// States visited, in order; the last one is final
    pub history: Vec<BucketState>,
    /// Unit tally when the bucket was executed in this run
    pub tally: Option<BatchTally>,
    /// Cumulative score after this bucket
    pub score: Option<CoverageScore>,
    /// Report-step problem
    pub warning: Option<String>,
    /// Hard failure
    pub error: Option<String>,
    #[serde(skip)]
    key: BucketLabel,
}

impl BucketRecord {
    fn new(label: BucketLabel) -> Self {
        Self {
            label: label.to_string(),
            history: vec![BucketState::Pending],
            tally: None,
            score: None,
            warning: None,
            error: None,
            key: label,
        }
    }

    fn enter(&mut self, state: BucketState) {
        self.history.push(state);
    }

    /// Bucket label
    #[must_use]
    pub const fn bucket(&self) -> BucketLabel {
        self.key
    }

    /// Final state
    #[must_use]
    pub fn state(&self) -> BucketState {
        self.history.last().copied().unwrap_or(BucketState::Pending)
    }

    /// Whether the bucket visited `state`
    #[must_use]
    pub fn visited(&self, state: BucketState) -> bool {
        self.history.contains(&state)
    }

    /// Whether the stored profile was reused
    #[must_use]
    pub fn resumed(&self) -> bool {
        self.visited(BucketState::Resumed)
    }
}

// ============================================================================
// Summary
// ============================================================================

/// Result of one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    /// Baseline name
    pub baseline: String,
    /// RFC 3339 start time
    pub started_at: String,
    /// Directory the buckets were read from
    pub buckets_root: PathBuf,
    /// One record per attempted bucket, in processing order
    pub buckets: Vec<BucketRecord>,
    /// Whether an interrupt stopped the run
    pub cancelled: bool,
}

impl PipelineSummary {
    fn new(baseline: &str, buckets_root: PathBuf) -> Self {
        Self {
            baseline: baseline.to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
            buckets_root,
            buckets: Vec::new(),
            cancelled: false,
        }
    }

    /// Whether no bucket was found at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Buckets that ended in a hard failure
    #[must_use]
    pub fn failures(&self) -> Vec<&BucketRecord> {
        self.buckets
            .iter()
            .filter(|b| b.state() == BucketState::Failed)
            .collect()
    }

    /// Whether every bucket finished without a hard failure
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failures().is_empty()
    }

    /// Cumulative score after the last reported bucket
    #[must_use]
    pub fn final_score(&self) -> Option<CoverageScore> {
        self.buckets.iter().rev().find_map(|b| b.score)
    }

    /// Ascending table of bucket label to cumulative score
    #[must_use]
    pub fn render_table(&self) -> String {
        let mut rows: Vec<&BucketRecord> = self.buckets.iter().collect();
        rows.sort_by_key(|b| b.bucket());
        let mut out = String::new();
        let _ = writeln!(out, "Cumulative coverage ({})", self.baseline);
        let _ = writeln!(out, "{:<16} {}", "bucket", "score");
        for row in rows {
            let cell = match (row.score, row.state()) {
                (Some(score), _) => score.to_string(),
                (None, BucketState::Failed) => "FAILED".to_string(),
                (None, BucketState::Cancelled) => "CANCELLED".to_string(),
                (None, _) => "no report".to_string(),
            };
            let _ = writeln!(out, "{:<16} {}", row.label, cell);
        }
        out
    }

    /// Write `summary.txt` and `summary.json`
    pub fn write(&self, layout: &ArtifactLayout) -> HarvestResult<()> {
        std::fs::create_dir_all(layout.baseline_dir())?;
        std::fs::write(layout.summary_txt(), self.render_table())?;
        std::fs::write(layout.summary_json(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

// ============================================================================
// Observer
// ============================================================================

/// Progress hooks for front ends; every method defaults to doing nothing
pub trait PipelineObserver: Send + Sync {
    /// A bucket is about to be processed
    fn bucket_started(&self, _label: BucketLabel, _index: usize, _count: usize) {}

    /// Units were discovered for an executed bucket
    fn batch_started(&self, _label: BucketLabel, _units: usize) {}

    /// One unit finished
    fn unit_finished(&self, _label: BucketLabel, _outcome: &RunOutcome) {}

    /// A bucket reached its final state
    fn bucket_finished(&self, _record: &BucketRecord) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

// ============================================================================
// Pipeline
// ============================================================================

/// Build the sandbox described by the configuration
///
/// Returns the sandbox and the work root paths inside it are rooted at.
pub fn sandbox_from_config(
    config: &HarvestConfig,
) -> HarvestResult<(Box<dyn Sandbox>, PathBuf)> {
    match config.sandbox.kind {
        SandboxKind::Docker => {
            let sandbox = DockerSandbox::builder()
                .image(config.sandbox.resolved_image())
                .container_name(config.sandbox.resolved_container_name(&config.baseline))
                .build()?;
            Ok((Box::new(sandbox), config.sandbox.work_root.clone()))
        }
        SandboxKind::Local => {
            let root = ArtifactLayout::new(&config.output_root, &config.baseline)
                .local_sandbox_root();
            Ok((Box::new(LocalSandbox::new(&root)), root))
        }
    }
}

/// Sequences classification, execution, merging and reporting
pub struct Pipeline {
    config: HarvestConfig,
    sandbox: Box<dyn Sandbox>,
    sandbox_layout: SandboxLayout,
    layout: ArtifactLayout,
    merge_tool: Box<dyn MergeTool>,
    renderer: Option<Box<dyn ReportRenderer>>,
    extractor: CoverageExtractor,
    shutdown: Shutdown,
    observer: Arc<dyn PipelineObserver>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("baseline", &self.config.baseline)
            .field("sandbox", &self.sandbox.name())
            .field("work_root", &self.sandbox_layout.work_root())
            .field("merge_tool", &self.merge_tool)
            .field("renderer", &self.renderer)
            .finish()
    }
}

impl Pipeline {
    /// Pipeline over an explicit sandbox, merging with `llvm-profdata` and
    /// rendering with `llvm-cov` when a reference binary is configured
    #[must_use]
    pub fn new(
        config: HarvestConfig,
        sandbox: Box<dyn Sandbox>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        let toolchain = Toolchain::from_config(&config.tools);
        let merge_tool = LlvmProfdata::new(toolchain.profdata)
            .with_failure_mode(config.tools.merge_failure_mode.clone());
        let renderer = config.report.reference_binary.clone().map(|binary| {
            Box::new(
                LlvmCovHtml::new(toolchain.cov, binary)
                    .with_ignore_filename_regex(config.report.ignore_filename_regex.clone()),
            ) as Box<dyn ReportRenderer>
        });
        let extractor =
            CoverageExtractor::new(config.report.parser, config.required_substrings.clone());
        let layout = ArtifactLayout::new(&config.output_root, &config.baseline);
        Self {
            sandbox,
            sandbox_layout: SandboxLayout::new(work_root),
            layout,
            merge_tool: Box::new(merge_tool),
            renderer,
            extractor,
            shutdown: Shutdown::new(),
            observer: Arc::new(NoopObserver),
            config,
        }
    }

    /// Pipeline with the sandbox described by the configuration
    pub fn from_config(config: HarvestConfig) -> HarvestResult<Self> {
        let (sandbox, work_root) = sandbox_from_config(&config)?;
        Ok(Self::new(config, sandbox, work_root))
    }

    /// Replace the merge tool
    #[must_use]
    pub fn with_merge_tool(mut self, tool: Box<dyn MergeTool>) -> Self {
        self.merge_tool = tool;
        self
    }

    /// Replace the report renderer; `None` skips reporting with a warning
    #[must_use]
    pub fn with_renderer(mut self, renderer: Option<Box<dyn ReportRenderer>>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Share an interrupt signal
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Receive progress callbacks
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Host artifact layout
    #[must_use]
    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Run the whole pipeline.
    ///
    /// Input and sandbox failures abort with an error; bucket failures are
    /// recorded in the summary.
    pub async fn run(&self) -> HarvestResult<PipelineSummary> {
        self.config.validate()?;
        let buckets_root = self.prepare_buckets()?;
        let buckets = list_buckets(&buckets_root)?;
        let mut summary = PipelineSummary::new(&self.config.baseline, buckets_root);
        if buckets.is_empty() {
            warn!("no buckets to process");
            return Ok(summary);
        }

        info!(sandbox = self.sandbox.name(), "provisioning sandbox");
        let handle = self.sandbox.provision().await?;
        let outcome = match self.resolve_tools(&handle).await {
            Ok(()) => self.run_buckets(&handle, &buckets, &mut summary).await,
            Err(e) => Err(e),
        };

        info!(sandbox = %handle, "tearing down sandbox");
        let teardown = self.sandbox.teardown(&handle).await;
        let written = summary.write(&self.layout);
        match (outcome, teardown) {
            (Ok(()), Ok(())) => {
                written?;
                Ok(summary)
            }
            (Ok(()), Err(e)) => {
                error!(error = %e, "sandbox teardown failed");
                Err(e)
            }
            (Err(e), teardown) => {
                if let Err(t) = teardown {
                    error!(error = %t, "sandbox teardown failed");
                }
                if let Err(w) = written {
                    warn!(error = %w, "failed to write run summary");
                }
                Err(e)
            }
        }
    }

    /// Resolve the merge and render tools inside the fresh sandbox, before
    /// any bucket input is copied in or executed
    async fn resolve_tools(&self, handle: &SandboxHandle) -> HarvestResult<()> {
        self.merge_tool.prepare(self.sandbox.as_ref(), handle).await?;
        if let Some(ref renderer) = self.renderer {
            renderer.prepare(self.sandbox.as_ref(), handle).await?;
        }
        Ok(())
    }

    /// Use the target directly when it is already classified, otherwise
    /// classify it afresh into the baseline's bucket directory
    fn prepare_buckets(&self) -> HarvestResult<PathBuf> {
        if is_classified(&self.config.target) {
            info!(
                dir = %self.config.target.display(),
                "target already classified, using it as bucket input"
            );
            return Ok(self.config.target.clone());
        }
        let buckets_dir = self.layout.buckets_dir();
        if buckets_dir.exists() {
            std::fs::remove_dir_all(&buckets_dir)?;
        }
        let classification = Bucketizer::new(&self.config.target, self.config.interval_secs)?
            .with_extensions(&self.config.source_extensions)
            .with_filter(self.config.filter.as_deref())
            .classify_into(&buckets_dir)?;
        if classification.is_empty() {
            std::fs::create_dir_all(&buckets_dir)?;
        }
        for (label, count) in classification.label_counts() {
            info!(label = %label, files = count, "bucket");
        }
        Ok(buckets_dir)
    }

    async fn run_buckets(
        &self,
        handle: &SandboxHandle,
        buckets: &[(BucketLabel, PathBuf)],
        summary: &mut PipelineSummary,
    ) -> HarvestResult<()> {
        let mut cumulative = CumulativeProfile::new(
            self.layout.cumulative_profile(),
            self.sandbox_layout.cumulative_dir(),
        );
        cumulative.reset()?;

        for (index, (label, dir)) in buckets.iter().enumerate() {
            if self.shutdown.is_triggered() {
                summary.cancelled = true;
                break;
            }
            self.observer.bucket_started(*label, index, buckets.len());
            let record = self
                .process_bucket(handle, *label, dir, &mut cumulative)
                .instrument(info_span!("bucket", label = %label))
                .await;
            if record.state() == BucketState::Cancelled {
                summary.cancelled = true;
            }
            self.observer.bucket_finished(&record);
            summary.buckets.push(record);
        }
        Ok(())
    }

    async fn process_bucket(
        &self,
        handle: &SandboxHandle,
        label: BucketLabel,
        dir: &Path,
        cumulative: &mut CumulativeProfile,
    ) -> BucketRecord {
        let mut record = BucketRecord::new(label);
        match self
            .advance(handle, label, dir, cumulative, &mut record)
            .await
        {
            Ok(()) => {}
            Err(HarvestError::Cancelled) => {
                warn!("bucket interrupted");
                record.enter(BucketState::Cancelled);
            }
            Err(e) => {
                error!(error = %e, kind = %e.kind(), "bucket failed");
                record.error = Some(e.to_string());
                record.enter(BucketState::Failed);
            }
        }
        record
    }

    async fn advance(
        &self,
        handle: &SandboxHandle,
        label: BucketLabel,
        dir: &Path,
        cumulative: &mut CumulativeProfile,
        record: &mut BucketRecord,
    ) -> HarvestResult<()> {
        let merger = ProfileMerger::new(self.sandbox.as_ref(), handle, self.merge_tool.as_ref());

        if self.layout.is_resumable(label) {
            info!(
                profile = %self.layout.merged_profile(label).display(),
                "resuming from stored bucket profile"
            );
            record.enter(BucketState::Resumed);
        } else {
            record.tally = Some(self.execute_bucket(handle, label, dir, &merger).await?);
            record.enter(BucketState::Executed);
        }

        cumulative
            .fold(&merger, label, &self.layout.merged_profile(label))
            .await?;
        record.enter(BucketState::Merged);

        match self.report(handle, label, cumulative).await {
            Ok(score) => {
                info!(score = %score, "cumulative coverage");
                record.score = Some(score);
                record.enter(BucketState::Reported);
            }
            Err(e) => {
                warn!(error = %e, "report step failed");
                record.warning = Some(e.to_string());
                record.enter(BucketState::ReportedWithWarning);
            }
        }
        record.enter(BucketState::Done);
        Ok(())
    }

    /// Run the bucket's units and persist its profile and log
    async fn execute_bucket(
        &self,
        handle: &SandboxHandle,
        label: BucketLabel,
        dir: &Path,
        merger: &ProfileMerger<'_>,
    ) -> HarvestResult<BatchTally> {
        let sandbox = self.sandbox.as_ref();
        let inputs = self.sandbox_layout.inputs(label);
        let raw = self.sandbox_layout.profraw(label);

        // Raw profiles of an interrupted earlier attempt must not be merged.
        sandbox.remove(handle, &raw).await?;
        sandbox.copy_in(handle, dir, &inputs).await?;
        let result = self
            .run_and_merge(handle, label, dir, merger, &inputs, &raw)
            .await;

        for leftover in [&inputs, &raw] {
            if let Err(e) = sandbox.remove(handle, leftover).await {
                warn!(
                    error = %e,
                    dir = %leftover.display(),
                    "failed to clean up sandbox directory"
                );
            }
        }
        result
    }

    async fn run_and_merge(
        &self,
        handle: &SandboxHandle,
        label: BucketLabel,
        dir: &Path,
        merger: &ProfileMerger<'_>,
        inputs: &Path,
        raw: &Path,
    ) -> HarvestResult<BatchTally> {
        let sandbox = self.sandbox.as_ref();
        let units = discover_units(
            dir,
            self.config.unit_mode,
            &self.config.source_extensions,
            inputs,
            raw,
        )?;
        self.observer.batch_started(label, units.len());

        let runner_config = RunnerConfig::from_harvest(&self.config);
        let runner = IsolatedRunner::new(sandbox, handle, &runner_config);
        let executor = BatchExecutor::new(runner, self.config.effective_workers());
        let report = executor
            .execute(&units, &self.shutdown, |outcome| {
                self.observer.unit_finished(label, outcome);
            })
            .await?;

        std::fs::create_dir_all(self.layout.bucket_dir(label))?;
        std::fs::write(self.layout.run_log(label), report.render_log())?;
        if report.was_cancelled() {
            return Err(HarvestError::Cancelled);
        }

        let merged = self.sandbox_layout.profdata(label);
        merger.merge_bucket(raw, &merged).await?;
        let durable = self.layout.merged_profile(label);
        let staging = durable.with_extension("profdata.tmp");
        sandbox.copy_out(handle, &merged, &staging).await?;
        std::fs::rename(&staging, &durable)?;
        Ok(report.tally)
    }

    /// Render and extract the cumulative report for one bucket
    async fn report(
        &self,
        handle: &SandboxHandle,
        label: BucketLabel,
        cumulative: &CumulativeProfile,
    ) -> HarvestResult<CoverageScore> {
        let Some(ref renderer) = self.renderer else {
            return Err(HarvestError::report(
                "No reference binary configured, skipping coverage report",
            ));
        };
        let index = renderer
            .render(
                self.sandbox.as_ref(),
                handle,
                &cumulative.sandbox_path(),
                &self.sandbox_layout.report_dir(label),
            )
            .await?;
        let host_report = self.layout.report(label);
        self.sandbox.copy_out(handle, &index, &host_report).await?;

        let coverage = self.extractor.extract_file(&host_report)?;
        let title = format!("{} {label} (cumulative)", self.config.baseline);
        std::fs::write(
            self.layout.coverage_summary(label),
            coverage.render_summary(&title),
        )?;
        Ok(coverage.score())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{Library, SandboxConfig};

    fn record(label: BucketLabel, states: &[BucketState]) -> BucketRecord {
        let mut record = BucketRecord::new(label);
        for state in states {
            record.enter(*state);
        }
        record
    }

    #[test]
    fn test_record_tracks_history() {
        let record = record(
            BucketLabel::new(0, 60),
            &[BucketState::Resumed, BucketState::Merged, BucketState::Done],
        );
        assert!(record.resumed());
        assert_eq!(record.state(), BucketState::Done);
        assert_eq!(record.label, "0-60");
    }

    #[test]
    fn test_summary_table_sorted_numerically() {
        let mut summary = PipelineSummary::new("b", PathBuf::from("x"));
        let mut late = record(BucketLabel::new(100, 160), &[BucketState::Done]);
        late.score = Some(CoverageScore {
            covered: 3,
            total: 4,
        });
        summary.buckets.push(late);
        summary
            .buckets
            .push(record(BucketLabel::new(60, 120), &[BucketState::Failed]));
        summary
            .buckets
            .push(record(BucketLabel::new(0, 60), &[BucketState::Done]));
        let table = summary.render_table();
        let first = table.find("0-60").unwrap();
        let second = table.find("60-120").unwrap();
        let third = table.find("100-160").unwrap();
        assert!(first < second && second < third);
        assert!(table.contains("FAILED"));
        assert!(table.contains("3/4 (75.00%)"));
        assert!(!summary.is_success());
        assert_eq!(summary.final_score().unwrap().covered, 3);
    }

    #[test]
    fn test_summary_json_uses_labels() {
        let mut summary = PipelineSummary::new("b", PathBuf::from("x"));
        summary
            .buckets
            .push(record(BucketLabel::new(0, 60), &[BucketState::ReportedWithWarning]));
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["buckets"][0]["label"], "0-60");
        assert_eq!(json["buckets"][0]["history"][1], "reported_with_warning");
    }

    #[test]
    fn test_sandbox_from_config() {
        let config = HarvestConfig::default().with_baseline("acetest");
        let (sandbox, work_root) = sandbox_from_config(&config).unwrap();
        assert_eq!(sandbox.name(), "torch_cov_2.2.0-acetest");
        assert_eq!(work_root, PathBuf::from("/root"));

        let local = config.with_sandbox(SandboxConfig {
            kind: SandboxKind::Local,
            library: Library::Tf,
            ..SandboxConfig::default()
        });
        let (sandbox, work_root) = sandbox_from_config(&local).unwrap();
        assert_eq!(sandbox.name(), "local");
        assert!(work_root.ends_with("acetest-sandbox"));
    }
}
