//! Per-file coverage figures, filtering and the textual bucket summary

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Write as _;

/// Covered and total lines of one source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCoverage {
    /// Path as printed by the report
    pub path: String,
    /// Lines executed at least once
    pub covered: u64,
    /// Instrumented lines
    pub total: u64,
}

impl FileCoverage {
    /// Create a file entry
    #[must_use]
    pub fn new(path: impl Into<String>, covered: u64, total: u64) -> Self {
        Self {
            path: path.into(),
            covered,
            total,
        }
    }

    /// Line coverage in percent; 0 for files without instrumented lines
    #[must_use]
    pub fn percent(&self) -> f64 {
        percent(self.covered, self.total)
    }
}

/// Aggregate score over a filtered file set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageScore {
    /// Sum of covered lines
    pub covered: u64,
    /// Sum of instrumented lines
    pub total: u64,
}

impl CoverageScore {
    /// Coverage in percent; 0 when nothing is instrumented
    #[must_use]
    pub fn percent(&self) -> f64 {
        percent(self.covered, self.total)
    }
}

impl std::fmt::Display for CoverageScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({:.2}%)", self.covered, self.total, self.percent())
    }
}

fn percent(covered: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        covered as f64 * 100.0 / total as f64
    }
}

/// Coverage figures extracted from one rendered report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageReport {
    files: Vec<FileCoverage>,
    required: Vec<String>,
}

impl CoverageReport {
    /// Wrap parsed entries
    #[must_use]
    pub fn new(files: Vec<FileCoverage>) -> Self {
        Self {
            files,
            required: Vec::new(),
        }
    }

    /// Entries in report order
    #[must_use]
    pub fn files(&self) -> &[FileCoverage] {
        &self.files
    }

    /// Substrings every kept path contains
    #[must_use]
    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// Keep only paths containing every one of `required`
    #[must_use]
    pub fn filter(self, required: &[String]) -> Self {
        let files = self
            .files
            .into_iter()
            .filter(|f| required.iter().all(|needle| f.path.contains(needle.as_str())))
            .collect();
        let mut all_required = self.required;
        all_required.extend(required.iter().cloned());
        Self {
            files,
            required: all_required,
        }
    }

    /// Summed covered/total lines
    #[must_use]
    pub fn score(&self) -> CoverageScore {
        self.files
            .iter()
            .fold(CoverageScore::default(), |acc, f| CoverageScore {
                covered: acc.covered + f.covered,
                total: acc.total + f.total,
            })
    }

    /// Entries by covered desc, total desc, path asc
    #[must_use]
    pub fn ranked(&self) -> Vec<&FileCoverage> {
        let mut ranked: Vec<&FileCoverage> = self.files.iter().collect();
        ranked.sort_by(|a, b| rank(a, b));
        ranked
    }

    /// Human-readable summary for one bucket
    #[must_use]
    pub fn render_summary(&self, title: &str) -> String {
        let score = self.score();
        let mut out = String::new();
        let _ = writeln!(out, "Coverage summary: {title}");
        if self.required.is_empty() {
            let _ = writeln!(out, "Filter: (none)");
        } else {
            let _ = writeln!(out, "Filter: {} (all required)", self.required.join(", "));
        }
        let _ = writeln!(
            out,
            "Total: {}/{} lines ({:.2}%) in {} files",
            score.covered,
            score.total,
            score.percent(),
            self.files.len()
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "{:>10} {:>10} {:>8}  file", "covered", "total", "%");
        for file in self.ranked() {
            let _ = writeln!(
                out,
                "{:>10} {:>10} {:>7.2}%  {}",
                file.covered,
                file.total,
                file.percent(),
                file.path
            );
        }
        out
    }
}

fn rank(a: &FileCoverage, b: &FileCoverage) -> Ordering {
    b.covered
        .cmp(&a.covered)
        .then_with(|| b.total.cmp(&a.total))
        .then_with(|| a.path.cmp(&b.path))
}
