//! Where artifacts live
//!
//! Host side, under `output_root`:
//!
//! ```text
//! <baseline>-buckets/<label>/<group>/...    classified inputs
//! <baseline>/<label>/merged.profdata        bucket profile (resume marker)
//! <baseline>/<label>/run.log
//! <baseline>/<label>/report.html
//! <baseline>/<label>/coverage.txt
//! <baseline>/cumulative.profdata
//! <baseline>/summary.txt, summary.json
//! ```
//!
//! Sandbox side, under the work root: `inputs/`, `profraw/`, `profdata/`,
//! `cumulative/` and `report/`, each keyed by label.

use crate::bucket::BucketLabel;
use std::path::{Path, PathBuf};

/// Bucket profile file name
pub const MERGED_PROFILE: &str = "merged.profdata";
/// Per-bucket execution log
pub const RUN_LOG: &str = "run.log";
/// Rendered report copied out of the sandbox
pub const REPORT_HTML: &str = "report.html";
/// Extracted per-file summary
pub const COVERAGE_SUMMARY: &str = "coverage.txt";
/// Running cumulative profile
pub const CUMULATIVE_PROFILE: &str = "cumulative.profdata";
/// Final score table
pub const SUMMARY_TXT: &str = "summary.txt";
/// Final machine-readable summary
pub const SUMMARY_JSON: &str = "summary.json";

/// Durable host-side layout for one baseline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    output_root: PathBuf,
    baseline: String,
}

impl ArtifactLayout {
    /// Layout rooted at `output_root` for `baseline`
    #[must_use]
    pub fn new(output_root: impl Into<PathBuf>, baseline: impl Into<String>) -> Self {
        Self {
            output_root: output_root.into(),
            baseline: baseline.into(),
        }
    }

    /// Output root
    #[must_use]
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Baseline name
    #[must_use]
    pub fn baseline(&self) -> &str {
        &self.baseline
    }

    /// `output_root/<baseline>`
    #[must_use]
    pub fn baseline_dir(&self) -> PathBuf {
        self.output_root.join(&self.baseline)
    }

    /// Where classified inputs are written when the target is not classified
    #[must_use]
    pub fn buckets_dir(&self) -> PathBuf {
        self.output_root.join(format!("{}-buckets", self.baseline))
    }

    /// Scratch root for the host-process sandbox
    #[must_use]
    pub fn local_sandbox_root(&self) -> PathBuf {
        self.output_root.join(format!("{}-sandbox", self.baseline))
    }

    /// `output_root/<baseline>/<label>`
    #[must_use]
    pub fn bucket_dir(&self, label: BucketLabel) -> PathBuf {
        self.baseline_dir().join(label.to_string())
    }

    /// Persisted bucket profile
    #[must_use]
    pub fn merged_profile(&self, label: BucketLabel) -> PathBuf {
        self.bucket_dir(label).join(MERGED_PROFILE)
    }

    /// Persisted run log
    #[must_use]
    pub fn run_log(&self, label: BucketLabel) -> PathBuf {
        self.bucket_dir(label).join(RUN_LOG)
    }

    /// Persisted rendered report
    #[must_use]
    pub fn report(&self, label: BucketLabel) -> PathBuf {
        self.bucket_dir(label).join(REPORT_HTML)
    }

    /// Persisted coverage summary
    #[must_use]
    pub fn coverage_summary(&self, label: BucketLabel) -> PathBuf {
        self.bucket_dir(label).join(COVERAGE_SUMMARY)
    }

    /// Running cumulative profile
    #[must_use]
    pub fn cumulative_profile(&self) -> PathBuf {
        self.baseline_dir().join(CUMULATIVE_PROFILE)
    }

    /// Final score table
    #[must_use]
    pub fn summary_txt(&self) -> PathBuf {
        self.baseline_dir().join(SUMMARY_TXT)
    }

    /// Final JSON summary
    #[must_use]
    pub fn summary_json(&self) -> PathBuf {
        self.baseline_dir().join(SUMMARY_JSON)
    }

    /// A bucket can be resumed when its profile was persisted earlier
    #[must_use]
    pub fn is_resumable(&self, label: BucketLabel) -> bool {
        self.merged_profile(label).is_file()
    }
}

/// Paths inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLayout {
    work_root: PathBuf,
}

impl SandboxLayout {
    /// Layout below `work_root`
    #[must_use]
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
        }
    }

    /// Sandbox work root
    #[must_use]
    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    /// Bucket inputs
    #[must_use]
    pub fn inputs(&self, label: BucketLabel) -> PathBuf {
        self.work_root.join("inputs").join(label.to_string())
    }

    /// Raw profiles of a bucket
    #[must_use]
    pub fn profraw(&self, label: BucketLabel) -> PathBuf {
        self.work_root.join("profraw").join(label.to_string())
    }

    /// Bucket profile before it is copied out
    #[must_use]
    pub fn profdata(&self, label: BucketLabel) -> PathBuf {
        self.work_root
            .join("profdata")
            .join(label.to_string())
            .join(MERGED_PROFILE)
    }

    /// Scratch directory for cumulative merges
    #[must_use]
    pub fn cumulative_dir(&self) -> PathBuf {
        self.work_root.join("cumulative")
    }

    /// Rendered report directory
    #[must_use]
    pub fn report_dir(&self, label: BucketLabel) -> PathBuf {
        self.work_root.join("report").join(label.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_host_paths() {
        let layout = ArtifactLayout::new("_result", "acetest");
        let label = BucketLabel::new(60, 120);
        assert_eq!(layout.buckets_dir(), PathBuf::from("_result/acetest-buckets"));
        assert_eq!(
            layout.merged_profile(label),
            PathBuf::from("_result/acetest/60-120/merged.profdata")
        );
        assert_eq!(layout.run_log(label), PathBuf::from("_result/acetest/60-120/run.log"));
        assert_eq!(
            layout.cumulative_profile(),
            PathBuf::from("_result/acetest/cumulative.profdata")
        );
        assert_eq!(layout.summary_json(), PathBuf::from("_result/acetest/summary.json"));
    }

    #[test]
    fn test_sandbox_paths() {
        let layout = SandboxLayout::new("/root");
        let label = BucketLabel::new(0, 60);
        assert_eq!(layout.inputs(label), PathBuf::from("/root/inputs/0-60"));
        assert_eq!(layout.profraw(label), PathBuf::from("/root/profraw/0-60"));
        assert_eq!(
            layout.profdata(label),
            PathBuf::from("/root/profdata/0-60/merged.profdata")
        );
        assert_eq!(layout.report_dir(label), PathBuf::from("/root/report/0-60"));
    }

    #[test]
    fn test_resumable_only_with_profile() {
        let dir = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(dir.path(), "b");
        let label = BucketLabel::new(0, 60);
        assert!(!layout.is_resumable(label));
        std::fs::create_dir_all(layout.bucket_dir(label)).unwrap();
        std::fs::write(layout.run_log(label), "").unwrap();
        assert!(!layout.is_resumable(label));
        std::fs::write(layout.merged_profile(label), "").unwrap();
        assert!(layout.is_resumable(label));
    }
}
