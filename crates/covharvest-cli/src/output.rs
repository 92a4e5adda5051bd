//! Terminal output and progress reporting

use console::{style, Term};
use covharvest::pipeline::PipelineObserver;
use covharvest::{BucketLabel, BucketRecord, BucketState, PipelineSummary, RunOutcome};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;

/// Progress reporter for bucket processing
///
/// Writes to stderr; the final table goes to stdout through the caller.
#[derive(Debug)]
pub struct ProgressReporter {
    term: Term,
    progress_bar: Mutex<Option<ProgressBar>>,
    /// Whether to use colors
    pub use_color: bool,
    /// Quiet mode
    pub quiet: bool,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(true, false)
    }
}

impl ProgressReporter {
    /// Create a new progress reporter
    #[must_use]
    pub fn new(use_color: bool, quiet: bool) -> Self {
        Self {
            term: Term::stderr(),
            progress_bar: Mutex::new(None),
            use_color,
            quiet,
        }
    }

    fn bar(&self) -> std::sync::MutexGuard<'_, Option<ProgressBar>> {
        self.progress_bar
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start a progress bar over `total` units
    pub fn start_progress(&self, total: u64, message: &str) {
        if self.quiet {
            return;
        }

        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        pb.set_message(message.to_string());
        *self.bar() = Some(pb);
    }

    /// Increment progress
    pub fn increment(&self, delta: u64) {
        if let Some(ref pb) = *self.bar() {
            pb.inc(delta);
        }
    }

    /// Finish and drop the progress bar
    pub fn finish(&self) {
        if let Some(pb) = self.bar().take() {
            pb.finish_and_clear();
        }
    }

    fn line(&self, message: &str) {
        let guard = self.bar();
        match *guard {
            Some(ref pb) => pb.suspend(|| {
                let _ = self.term.write_line(message);
            }),
            None => {
                let _ = self.term.write_line(message);
            }
        }
    }

    fn prefixed(&self, symbol: console::StyledObject<&str>, plain: &str, message: &str) {
        let prefix = if self.use_color {
            symbol.bold().to_string()
        } else {
            plain.to_string()
        };
        self.line(&format!("{prefix} {message}"));
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        if self.quiet {
            return;
        }
        self.prefixed(style("✓").green(), "OK  ", message);
    }

    /// Print a failure message; shown even in quiet mode
    pub fn failure(&self, message: &str) {
        self.prefixed(style("✗").red(), "FAIL", message);
    }

    /// Print a warning message
    pub fn warning(&self, message: &str) {
        if self.quiet {
            return;
        }
        self.prefixed(style("⚠").yellow(), "WARN", message);
    }

    /// Print an info message
    pub fn info(&self, message: &str) {
        if self.quiet {
            return;
        }
        self.prefixed(style("ℹ").blue(), "INFO", message);
    }

    /// Print a section header
    pub fn header(&self, title: &str) {
        if self.quiet {
            return;
        }

        let styled = if self.use_color {
            style(title).bold().underlined().to_string()
        } else {
            format!("=== {title} ===")
        };

        self.line("");
        self.line(&styled);
    }

    /// One-line verdict for a finished run
    pub fn summary(&self, summary: &PipelineSummary) {
        let failed = summary.failures().len();
        if self.quiet && failed == 0 {
            return;
        }
        let done = summary.buckets.len() - failed;
        let score = summary
            .final_score()
            .map_or_else(|| "no report".to_string(), |s| s.to_string());
        let verdict = if summary.cancelled {
            "INTERRUPTED"
        } else if failed > 0 {
            "FAILED"
        } else {
            "DONE"
        };
        let verdict = match (self.use_color, failed > 0 || summary.cancelled) {
            (true, true) => style(verdict).red().bold().to_string(),
            (true, false) => style(verdict).green().bold().to_string(),
            (false, _) => verdict.to_string(),
        };
        self.line("");
        self.line(&format!(
            "{verdict} {} buckets ({done} processed, {failed} failed), cumulative {score}",
            summary.buckets.len()
        ));
    }
}

impl PipelineObserver for ProgressReporter {
    fn bucket_started(&self, label: BucketLabel, index: usize, count: usize) {
        self.header(&format!("Bucket {label} ({}/{count})", index + 1));
    }

    fn batch_started(&self, label: BucketLabel, units: usize) {
        self.start_progress(units as u64, &label.to_string());
    }

    fn unit_finished(&self, _label: BucketLabel, outcome: &RunOutcome) {
        self.increment(1);
        if !outcome.is_ok() {
            self.warning(&format!("{} {}", outcome.status, outcome.unit));
        }
    }

    fn bucket_finished(&self, record: &BucketRecord) {
        self.finish();
        if let Some(ref tally) = record.tally {
            self.info(&tally.to_string());
        }
        match record.state() {
            BucketState::Failed => {
                let error = record.error.as_deref().unwrap_or("unknown error");
                self.failure(&format!("{}: {error}", record.label));
            }
            BucketState::Cancelled => self.warning(&format!("{}: interrupted", record.label)),
            _ => {
                let resumed = if record.resumed() { " (resumed)" } else { "" };
                match (record.score, record.warning.as_deref()) {
                    (Some(score), _) => {
                        self.success(&format!("{}{resumed}: cumulative {score}", record.label));
                    }
                    (None, Some(warning)) => {
                        self.warning(&format!("{}{resumed}: {warning}", record.label));
                    }
                    (None, None) => self.success(&format!("{}{resumed}", record.label)),
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    mod progress_reporter_tests {
        use super::*;

        #[test]
        fn test_new_reporter() {
            let reporter = ProgressReporter::new(true, false);
            assert!(reporter.use_color);
            assert!(!reporter.quiet);
        }

        #[test]
        fn test_messages_do_not_panic() {
            let reporter = ProgressReporter::new(false, false);
            reporter.header("Bucket 0-60 (1/3)");
            reporter.success("0-60: cumulative 1/2 (50.00%)");
            reporter.warning("TIMEOUT slow.py");
            reporter.info("total=2 ok=1 timeout=1 failed=0");
            reporter.failure("60-120: no profiles");
        }

        #[test]
        fn test_progress_bar_lifecycle() {
            let reporter = ProgressReporter::new(false, false);
            reporter.start_progress(3, "0-60");
            reporter.increment(1);
            reporter.warning("FAIL rc=1 a.py");
            reporter.increment(2);
            reporter.finish();
            assert!(reporter.bar().is_none());
        }

        #[test]
        fn test_quiet_mode_has_no_bar() {
            let reporter = ProgressReporter::new(false, true);
            reporter.start_progress(10, "0-60");
            assert!(reporter.bar().is_none());
            reporter.failure("shown");
        }

        #[test]
        fn test_empty_summary() {
            let reporter = ProgressReporter::new(false, false);
            let summary = PipelineSummary {
                baseline: "b".to_string(),
                started_at: String::new(),
                buckets_root: std::path::PathBuf::from("x"),
                buckets: Vec::new(),
                cancelled: false,
            };
            reporter.summary(&summary);
        }
    }
}
