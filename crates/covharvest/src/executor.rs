//! Batch Executor
//!
//! Fans a bucket's units out over at most `workers` concurrent runs. Each
//! unit carries its own timeout, so a stalled unit only occupies one slot.

use crate::config::UnitMode;
use crate::result::{HarvestError, HarvestResult};
use crate::runner::{IsolatedRunner, RunOutcome, RunStatus, Shutdown, WorkUnit};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Name of the raw profile written by a sub-batch unit
pub const SUBDIR_PROFILE_NAME: &str = "coverage.profraw";

// ============================================================================
// Unit discovery
// ============================================================================

/// Find the units of work in a classified bucket directory.
///
/// `bucket_dir` is the host copy; `inputs_root` and `profraw_root` are where
/// the same tree lives, and where raw profiles go, inside the sandbox.
pub fn discover_units(
    bucket_dir: &Path,
    mode: UnitMode,
    extensions: &[String],
    inputs_root: &Path,
    profraw_root: &Path,
) -> HarvestResult<Vec<WorkUnit>> {
    if !bucket_dir.is_dir() {
        return Err(HarvestError::input(format!(
            "Bucket directory does not exist: {}",
            bucket_dir.display()
        )));
    }
    let mut units = match mode {
        UnitMode::File => file_units(bucket_dir, extensions, inputs_root, profraw_root)?,
        UnitMode::Subdir => subdir_units(bucket_dir, inputs_root, profraw_root)?,
    };
    units.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(units)
}

fn file_units(
    bucket_dir: &Path,
    extensions: &[String],
    inputs_root: &Path,
    profraw_root: &Path,
) -> HarvestResult<Vec<WorkUnit>> {
    let mut units = Vec::new();
    let walker = WalkDir::new(bucket_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != "__pycache__");
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| extensions.iter().any(|x| x == ext));
        if !matches {
            continue;
        }
        let rel = path.strip_prefix(bucket_dir).unwrap_or(path);
        let input = inputs_root.join(rel);
        let cwd = input
            .parent()
            .map_or_else(|| inputs_root.to_path_buf(), Path::to_path_buf);
        units.push(WorkUnit {
            name: rel.to_string_lossy().into_owned(),
            input,
            cwd,
            profile: profile_path(profraw_root, rel),
        });
    }
    Ok(units)
}

/// `<profraw_root>/<rel>.profraw`, keeping the source extension so units
/// that differ only by extension get distinct profiles
fn profile_path(profraw_root: &Path, rel: &Path) -> PathBuf {
    let mut name = profraw_root.join(rel).into_os_string();
    name.push(".profraw");
    PathBuf::from(name)
}

fn subdir_units(
    bucket_dir: &Path,
    inputs_root: &Path,
    profraw_root: &Path,
) -> HarvestResult<Vec<WorkUnit>> {
    let mut units = Vec::new();
    for entry in std::fs::read_dir(bucket_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let input = inputs_root.join(&name);
        units.push(WorkUnit {
            profile: profraw_root.join(&name).join(SUBDIR_PROFILE_NAME),
            cwd: input.clone(),
            input,
            name,
        });
    }
    Ok(units)
}

// ============================================================================
// Tally and report
// ============================================================================

/// Aggregate counts for one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTally {
    /// Units in the batch
    pub total: usize,
    /// Exited cleanly
    pub ok: usize,
    /// Killed by the timeout
    pub timeout: usize,
    /// Nonzero exit or runner fault
    pub failed: usize,
    /// Stopped by an interrupt
    pub cancelled: usize,
}

impl BatchTally {
    /// Count one outcome
    pub fn record(&mut self, status: &RunStatus) {
        self.total += 1;
        match status {
            RunStatus::Success => self.ok += 1,
            RunStatus::TimedOut => self.timeout += 1,
            RunStatus::Failed { .. } | RunStatus::Fault { .. } => self.failed += 1,
            RunStatus::Cancelled => self.cancelled += 1,
        }
    }
}

impl std::fmt::Display for BatchTally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total={} ok={} timeout={} failed={}",
            self.total, self.ok, self.timeout, self.failed
        )?;
        if self.cancelled > 0 {
            write!(f, " cancelled={}", self.cancelled)?;
        }
        Ok(())
    }
}

/// Every outcome of one batch, sorted by unit name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    /// Outcomes in unit-name order
    pub outcomes: Vec<RunOutcome>,
    /// Aggregate counts
    pub tally: BatchTally,
    /// Wall-clock time for the whole batch
    pub duration: Duration,
}

impl BatchReport {
    /// Build a report from outcomes in completion order
    #[must_use]
    pub fn from_outcomes(mut outcomes: Vec<RunOutcome>, duration: Duration) -> Self {
        outcomes.sort_by(|a, b| a.unit.cmp(&b.unit));
        let mut tally = BatchTally::default();
        for outcome in &outcomes {
            tally.record(&outcome.status);
        }
        Self {
            outcomes,
            tally,
            duration,
        }
    }

    /// Whether any unit was stopped by an interrupt
    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        self.tally.cancelled > 0
    }

    /// Text persisted as the bucket's `run.log`
    #[must_use]
    pub fn render_log(&self) -> String {
        let mut log = String::new();
        for outcome in &self.outcomes {
            let _ = writeln!(log, "{} {}", outcome.status, outcome.unit);
            if let RunStatus::Fault { ref message } = outcome.status {
                let _ = writeln!(log, "  {message}");
            }
            if outcome.is_ok() {
                continue;
            }
            if !outcome.stdout.trim().is_empty() {
                let _ = writeln!(log, "--- stdout ---\n{}", outcome.stdout.trim_end());
            }
            if !outcome.stderr.trim().is_empty() {
                let _ = writeln!(log, "--- stderr ---\n{}", outcome.stderr.trim_end());
            }
        }
        let _ = writeln!(log, "{}", self.tally);
        log
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Bounded-concurrency dispatcher over an [`IsolatedRunner`]
#[derive(Debug, Clone, Copy)]
pub struct BatchExecutor<'a> {
    runner: IsolatedRunner<'a>,
    workers: usize,
}

impl<'a> BatchExecutor<'a> {
    /// Executor running at most `workers` units at once (minimum 1)
    #[must_use]
    pub fn new(runner: IsolatedRunner<'a>, workers: usize) -> Self {
        Self {
            runner,
            workers: workers.max(1),
        }
    }

    /// Concurrency bound
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Run every unit and collect all outcomes.
    ///
    /// `on_outcome` sees each outcome as it completes. Units not yet
    /// dispatched when `shutdown` triggers are recorded as cancelled.
    pub async fn execute(
        &self,
        units: &[WorkUnit],
        shutdown: &Shutdown,
        mut on_outcome: impl FnMut(&RunOutcome),
    ) -> HarvestResult<BatchReport> {
        if units.is_empty() {
            return Err(HarvestError::config(
                "No units of work discovered in bucket; check classification output",
            ));
        }
        info!(units = units.len(), workers = self.workers, "dispatching batch");
        let start = Instant::now();
        let runner = self.runner;
        let mut pending = stream::iter(units)
            .map(|unit| async move { runner.run(unit, shutdown).await })
            .buffer_unordered(self.workers);

        let mut outcomes = Vec::with_capacity(units.len());
        while let Some(outcome) = pending.next().await {
            debug!(unit = %outcome.unit, status = %outcome.status, "collected");
            on_outcome(&outcome);
            outcomes.push(outcome);
        }

        let report = BatchReport::from_outcomes(outcomes, start.elapsed());
        info!(
            tally = %report.tally,
            elapsed_ms = report.duration.as_millis() as u64,
            "batch complete"
        );
        Ok(report)
    }
}
