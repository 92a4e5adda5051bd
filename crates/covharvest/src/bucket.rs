//! Time-bucket classification of generated programs
//!
//! Files under a target root are grouped by their top-level subdirectory
//! (files directly under the root form the unnamed group). Each group is
//! bucketed against its own oldest modification time:
//!
//! ```text
//! offset = max(0, floor(mtime - group_min))
//! start  = (offset / interval) * interval
//! label  = "{start}-{start + interval}"
//! ```
//!
//! Labels are therefore only comparable within a group. Internally every
//! placement carries a [`BucketKey`] of `(group, label)`; the label-only
//! totals returned by [`Classification::label_counts`] sum across groups.

use crate::result::{HarvestError, HarvestResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Directory names skipped during discovery (byte-compiled caches)
const SKIPPED_DIRS: &[&str] = &["__pycache__"];

/// Half-open interval `[start, end)` in seconds relative to a group minimum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketLabel {
    start: u64,
    end: u64,
}

impl BucketLabel {
    /// Create a label from explicit bounds
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Label of the bucket containing `offset_secs`
    #[must_use]
    pub const fn for_offset(offset_secs: u64, interval_secs: u64) -> Self {
        let start = (offset_secs / interval_secs) * interval_secs;
        Self {
            start,
            end: start + interval_secs,
        }
    }

    /// Label for a timestamp relative to its group minimum.
    ///
    /// Timestamps earlier than the minimum clamp to offset zero.
    #[must_use]
    pub fn for_timestamp(ts: SystemTime, group_min: SystemTime, interval_secs: u64) -> Self {
        let offset = ts
            .duration_since(group_min)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::for_offset(offset, interval_secs)
    }

    /// Inclusive lower bound
    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// Exclusive upper bound
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    /// Whether an offset falls inside this bucket
    #[must_use]
    pub const fn contains(&self, offset_secs: u64) -> bool {
        self.start <= offset_secs && offset_secs < self.end
    }

    /// Whether a directory name looks like a bucket label (`^\d+-\d+$`)
    #[must_use]
    pub fn is_label(name: &str) -> bool {
        name.parse::<Self>().is_ok()
    }
}

impl fmt::Display for BucketLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for BucketLabel {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HarvestError::input(format!("Not a bucket label: '{s}'"));
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(start) || !all_digits(end) {
            return Err(invalid());
        }
        let start = start.parse().map_err(|_| invalid())?;
        let end = end.parse().map_err(|_| invalid())?;
        Ok(Self { start, end })
    }
}

/// Bucket identity qualified by its group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    /// Top-level group (empty for the root group)
    pub group: String,
    /// Label within that group
    pub label: BucketLabel,
}

/// A discovered source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Absolute or root-joined path on disk
    pub path: PathBuf,
    /// Path relative to the classification root
    pub relative: PathBuf,
    /// Top-level group (empty for files directly under the root)
    pub group: String,
    /// Modification time, used as a proxy for creation order
    pub modified: SystemTime,
}

impl SourceFile {
    /// Directory below the group that holds this file
    #[must_use]
    pub fn sub_dir(&self) -> PathBuf {
        let parent = self.relative.parent().unwrap_or_else(|| Path::new(""));
        if self.group.is_empty() {
            parent.to_path_buf()
        } else {
            parent
                .strip_prefix(&self.group)
                .map(Path::to_path_buf)
                .unwrap_or_default()
        }
    }
}

/// A file assigned to a bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// The file
    pub file: SourceFile,
    /// Its bucket
    pub key: BucketKey,
}

impl Placement {
    /// Destination directory below a result root
    #[must_use]
    pub fn dest_dir(&self, result_root: &Path) -> PathBuf {
        let mut dir = result_root.join(self.key.label.to_string());
        if !self.key.group.is_empty() {
            dir.push(&self.key.group);
        }
        let sub = self.file.sub_dir();
        if !sub.as_os_str().is_empty() {
            dir.push(sub);
        }
        dir
    }
}

/// Outcome of classifying a target tree
#[derive(Debug, Clone, Default)]
pub struct Classification {
    /// Where buckets were written
    pub result_root: PathBuf,
    /// Files per `(group, label)`
    pub per_key: BTreeMap<BucketKey, usize>,
    /// Final destination of every copied file
    pub copied: Vec<PathBuf>,
}

impl Classification {
    /// Files per label, summed across groups
    #[must_use]
    pub fn label_counts(&self) -> BTreeMap<BucketLabel, usize> {
        let mut counts = BTreeMap::new();
        for (key, count) in &self.per_key {
            *counts.entry(key.label).or_insert(0) += count;
        }
        counts
    }

    /// Total number of classified files
    #[must_use]
    pub fn total(&self) -> usize {
        self.per_key.values().sum()
    }

    /// Whether nothing was classified
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.per_key.is_empty()
    }
}

/// Partitions a directory of timestamped files into time buckets
#[derive(Debug, Clone)]
pub struct Bucketizer {
    root: PathBuf,
    interval_secs: u64,
    extensions: Vec<String>,
    filter: Option<Regex>,
}

impl Bucketizer {
    /// Create a bucketizer for `root` with the given interval
    pub fn new(root: impl Into<PathBuf>, interval_secs: i64) -> HarvestResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(HarvestError::input(format!(
                "Target directory does not exist: {}",
                root.display()
            )));
        }
        if interval_secs <= 0 {
            return Err(HarvestError::input(format!(
                "Interval must be a positive integer (seconds), got: {interval_secs}"
            )));
        }
        Ok(Self {
            root,
            interval_secs: interval_secs.unsigned_abs(),
            extensions: vec!["py".to_string()],
            filter: None,
        })
    }

    /// Set the recognised source extensions
    #[must_use]
    pub fn with_extensions(mut self, extensions: &[String]) -> Self {
        self.extensions = extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_string())
            .collect();
        self
    }

    /// Restrict discovery to relative paths matching `pattern`.
    ///
    /// An invalid pattern is reported and classification proceeds unfiltered.
    #[must_use]
    pub fn with_filter(mut self, pattern: Option<&str>) -> Self {
        self.filter = match pattern {
            Some(p) if !p.is_empty() => match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = p, error = %e, "invalid filter, classifying unfiltered");
                    None
                }
            },
            _ => None,
        };
        self
    }

    /// Whether a usable filter is active
    #[must_use]
    pub const fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    /// Bucket width in seconds
    #[must_use]
    pub const fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    fn is_source(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|want| want == ext))
    }

    /// Walk the root and group recognised files by top-level directory
    pub fn discover(&self) -> HarvestResult<BTreeMap<String, Vec<SourceFile>>> {
        let mut groups: BTreeMap<String, Vec<SourceFile>> = BTreeMap::new();
        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                !(e.file_type().is_dir()
                    && e.file_name()
                        .to_str()
                        .is_some_and(|n| SKIPPED_DIRS.contains(&n)))
            });

        for entry in walker {
            let entry = entry.map_err(|e| HarvestError::input(format!("Walk failed: {e}")))?;
            if !entry.file_type().is_file() || !self.is_source(entry.path()) {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| entry.path().to_path_buf());
            if let Some(ref re) = self.filter {
                if !re.is_match(&relative.to_string_lossy()) {
                    continue;
                }
            }
            let modified = match entry
                .metadata()
                .map_err(std::io::Error::from)
                .and_then(|m| m.modified())
            {
                Ok(t) => t,
                Err(e) => {
                    debug!(path = %entry.path().display(), error = %e, "skipping unreadable file");
                    continue;
                }
            };
            let group = group_of(&relative);
            groups.entry(group.clone()).or_default().push(SourceFile {
                path: entry.path().to_path_buf(),
                relative,
                group,
                modified,
            });
        }
        Ok(groups)
    }

    /// Assign every discovered file to its bucket without touching disk
    #[must_use]
    pub fn plan(&self, groups: &BTreeMap<String, Vec<SourceFile>>) -> Vec<Placement> {
        let mut placements = Vec::new();
        for (group, files) in groups {
            let Some(group_min) = files.iter().map(|f| f.modified).min() else {
                continue;
            };
            let group_max = files.iter().map(|f| f.modified).max().unwrap_or(group_min);
            let shown = if group.is_empty() { "ROOT" } else { group.as_str() };
            info!(
                group = shown,
                min = %epoch_secs(group_min),
                max = %epoch_secs(group_max),
                files = files.len(),
                "group time range"
            );
            for file in files {
                let label =
                    BucketLabel::for_timestamp(file.modified, group_min, self.interval_secs);
                placements.push(Placement {
                    file: file.clone(),
                    key: BucketKey {
                        group: group.clone(),
                        label,
                    },
                });
            }
        }
        placements
    }

    /// Discover, bucket and copy files into `result_root/<label>/<group>/...`
    pub fn classify_into(&self, result_root: &Path) -> HarvestResult<Classification> {
        let groups = self.discover()?;
        let mut classification = Classification {
            result_root: result_root.to_path_buf(),
            ..Classification::default()
        };
        if groups.is_empty() {
            info!(root = %self.root.display(), "no source files found to classify");
            return Ok(classification);
        }
        std::fs::create_dir_all(result_root)?;

        for placement in self.plan(&groups) {
            let dest_dir = placement.dest_dir(result_root);
            std::fs::create_dir_all(&dest_dir)?;
            let dest = free_destination(&dest_dir, &placement.file.path);
            std::fs::copy(&placement.file.path, &dest)?;
            *classification.per_key.entry(placement.key).or_insert(0) += 1;
            classification.copied.push(dest);
        }

        info!(
            files = classification.total(),
            buckets = classification.label_counts().len(),
            root = %result_root.display(),
            "classified source files"
        );
        Ok(classification)
    }
}

fn group_of(relative: &Path) -> String {
    let mut components = relative.components().filter_map(|c| match c {
        Component::Normal(part) => Some(part),
        _ => None,
    });
    match (components.next(), components.next()) {
        (Some(first), Some(_)) => first.to_string_lossy().into_owned(),
        _ => String::new(),
    }
}

fn epoch_secs(ts: SystemTime) -> String {
    ts.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| format!("{:.3}", d.as_secs_f64()))
        .unwrap_or_else(|_| "pre-epoch".to_string())
}

/// First free `name`, `stem__1.ext`, `stem__2.ext`, ... inside `dir`
fn free_destination(dir: &Path, source: &Path) -> PathBuf {
    let name = source.file_name().unwrap_or_default();
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = source
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut i = 1;
    loop {
        let candidate = dir.join(format!("{stem}__{i}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        i += 1;
    }
}

/// Whether `dir` already holds classified buckets
#[must_use]
pub fn is_classified(dir: &Path) -> bool {
    !list_buckets(dir).unwrap_or_default().is_empty()
}

/// Bucket directories directly under `dir`, in ascending numeric order
pub fn list_buckets(dir: &Path) -> HarvestResult<Vec<(BucketLabel, PathBuf)>> {
    let mut buckets = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(label) = entry
            .file_name()
            .to_str()
            .and_then(|n| n.parse::<BucketLabel>().ok())
        {
            buckets.push((label, entry.path()));
        }
    }
    buckets.sort_by_key(|(label, _)| *label);
    Ok(buckets)
}
