//! Coverage Extractor
//!
//! Turns a rendered report into per-file line figures, keeps the files
//! whose path contains every required substring, and sums them into the
//! bucket's score.

mod parse;
mod render;
mod summary;

pub use parse::{PatternParser, ReportParser, TableParser};
pub use render::{LlvmCovHtml, ReportRenderer, INDEX_FILE};
pub use summary::{CoverageReport, CoverageScore, FileCoverage};

use crate::config::ParserPreference;
use crate::result::{HarvestError, HarvestResult};
use std::path::Path;
use tracing::debug;

/// Chooses a parser per document and applies the path filter
#[derive(Debug, Clone)]
pub struct CoverageExtractor {
    preference: ParserPreference,
    required: Vec<String>,
}

impl CoverageExtractor {
    /// Extractor keeping paths that contain all of `required`
    #[must_use]
    pub fn new(preference: ParserPreference, required: Vec<String>) -> Self {
        Self {
            preference,
            required,
        }
    }

    /// Required substrings
    #[must_use]
    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// The parser that will handle `document`
    pub fn parser_for(&self, document: &str) -> HarvestResult<&'static dyn ReportParser> {
        static TABLE: TableParser = TableParser;
        static PATTERN: PatternParser = PatternParser;
        match self.preference {
            ParserPreference::Table if !TABLE.supports(document) => Err(HarvestError::report(
                "Report has no coverage table and the table parser was requested",
            )),
            ParserPreference::Table => Ok(&TABLE),
            ParserPreference::Pattern => Ok(&PATTERN),
            ParserPreference::Auto if TABLE.supports(document) => Ok(&TABLE),
            ParserPreference::Auto => Ok(&PATTERN),
        }
    }

    /// Extract and filter figures from a document
    pub fn extract(&self, document: &str) -> HarvestResult<CoverageReport> {
        let parser = self.parser_for(document)?;
        let files = parser.parse(document)?;
        debug!(parser = parser.name(), files = files.len(), "parsed report");
        Ok(CoverageReport::new(files).filter(&self.required))
    }

    /// Extract from a report file on the host
    pub fn extract_file(&self, path: &Path) -> HarvestResult<CoverageReport> {
        let document = std::fs::read_to_string(path).map_err(|e| {
            HarvestError::report(format!("Cannot read report {}: {e}", path.display()))
        })?;
        self.extract(&document)
    }
}
