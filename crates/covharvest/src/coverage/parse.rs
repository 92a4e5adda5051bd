//! Report parsers
//!
//! [`TableParser`] reads the file table of an `llvm-cov show -format=html`
//! index. [`PatternParser`] accepts anything that prints a path followed by a
//! `(covered/total)` figure and is the fallback when the table is absent.

use super::summary::FileCoverage;
use crate::result::{HarvestError, HarvestResult};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// One strategy for turning a rendered report into per-file figures
pub trait ReportParser: Send + Sync + std::fmt::Debug {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Whether this parser understands `document`
    fn supports(&self, document: &str) -> bool;

    /// Extract per-file line figures
    fn parse(&self, document: &str) -> HarvestResult<Vec<FileCoverage>>;
}

/// A pattern compiled on first use and shared by every parse
#[derive(Debug)]
struct CachedRegex {
    pattern: &'static str,
    compiled: OnceLock<Result<Regex, regex::Error>>,
}

impl CachedRegex {
    const fn new(pattern: &'static str) -> Self {
        Self {
            pattern,
            compiled: OnceLock::new(),
        }
    }

    fn get(&'static self) -> HarvestResult<&'static Regex> {
        self.compiled
            .get_or_init(|| Regex::new(self.pattern))
            .as_ref()
            .map_err(|e| HarvestError::report(format!("Bad report pattern: {e}")))
    }
}

fn strip_tags(fragment: &str, tag: &Regex) -> String {
    let text = tag.replace_all(fragment, " ");
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

fn pair(captures: &regex::Captures<'_>) -> Option<(u64, u64)> {
    let covered = captures.get(1)?.as_str().parse().ok()?;
    let total = captures.get(2)?.as_str().parse().ok()?;
    Some((covered, total))
}

static ROW: CachedRegex = CachedRegex::new(r"(?is)<tr[^>]*>(.*?)</tr>");
static CELL: CachedRegex = CachedRegex::new(r"(?is)<t[dh][^>]*>(.*?)</t[dh]>");
static TAG: CachedRegex = CachedRegex::new(r"(?s)<[^>]*>");
static FIGURE: CachedRegex = CachedRegex::new(r"\((\d+)/(\d+)\)");

// ============================================================================
// Table parser
// ============================================================================

/// Structured parser for the llvm-cov HTML index table
#[derive(Debug, Clone, Copy, Default)]
pub struct TableParser;

impl TableParser {
    fn rows(document: &str) -> HarvestResult<Vec<Vec<String>>> {
        let row = ROW.get()?;
        let cell = CELL.get()?;
        let tag = TAG.get()?;
        Ok(row
            .captures_iter(document)
            .filter_map(|r| r.get(1))
            .map(|r| {
                cell.captures_iter(r.as_str())
                    .filter_map(|c| c.get(1))
                    .map(|c| strip_tags(c.as_str(), tag).trim().to_string())
                    .collect()
            })
            .collect())
    }

    fn header_columns(row: &[String]) -> Option<(usize, usize)> {
        let file_col = row.iter().position(|c| c.contains("Filename"))?;
        let line_col = row.iter().position(|c| c.contains("Line Coverage"))?;
        Some((file_col, line_col))
    }
}

impl ReportParser for TableParser {
    fn name(&self) -> &'static str {
        "table"
    }

    fn supports(&self, document: &str) -> bool {
        Self::rows(document)
            .map(|rows| rows.iter().any(|r| Self::header_columns(r).is_some()))
            .unwrap_or(false)
    }

    fn parse(&self, document: &str) -> HarvestResult<Vec<FileCoverage>> {
        let rows = Self::rows(document)?;
        let figure = FIGURE.get()?;
        let Some((header_idx, (file_col, line_col))) = rows
            .iter()
            .enumerate()
            .find_map(|(i, r)| Self::header_columns(r).map(|cols| (i, cols)))
        else {
            return Err(HarvestError::report("No coverage table header found"));
        };

        let mut files = Vec::new();
        for row in &rows[header_idx + 1..] {
            let (Some(path), Some(line_cell)) = (row.get(file_col), row.get(line_col)) else {
                continue;
            };
            if path.is_empty() || path == "Totals" {
                continue;
            }
            if let Some((covered, total)) = figure.captures(line_cell).as_ref().and_then(pair) {
                files.push(FileCoverage::new(path.clone(), covered, total));
            }
        }
        Ok(files)
    }
}

// ============================================================================
// Pattern parser
// ============================================================================

/// Best-effort parser pairing each path with the next `(covered/total)`
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternParser;

static PATH: CachedRegex =
    CachedRegex::new(r"[A-Za-z0-9_.+\-/]*[A-Za-z0-9_+\-]\.[A-Za-z][A-Za-z0-9]*\b");

impl ReportParser for PatternParser {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn supports(&self, _document: &str) -> bool {
        true
    }

    fn parse(&self, document: &str) -> HarvestResult<Vec<FileCoverage>> {
        let tag = TAG.get()?;
        let path_re = PATH.get()?;
        let figure = FIGURE.get()?;
        let text = strip_tags(document, tag);

        let paths: Vec<_> = path_re.find_iter(&text).collect();
        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for (i, path) in paths.iter().enumerate() {
            let window_end = paths.get(i + 1).map_or(text.len(), |next| next.start());
            let window = &text[path.end()..window_end];
            let Some((covered, total)) = figure.captures(window).as_ref().and_then(pair) else {
                continue;
            };
            if seen.insert(path.as_str()) {
                files.push(FileCoverage::new(path.as_str(), covered, total));
            }
        }
        Ok(files)
    }
}
