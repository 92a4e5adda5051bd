//! Shared fixtures for the integration tests
//!
//! Profiles here are plain text, one `<file>:<line> <hits>` entry per line.
//! Merging sums hits per entry and rendering emits an `llvm-cov`-shaped
//! index table, so the whole pipeline runs on a host without LLVM.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use covharvest::coverage::ReportRenderer;
use covharvest::{
    HarvestConfig, HarvestError, HarvestResult, MergeTool, Sandbox, SandboxHandle, SandboxKind,
};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Line-hit merge: sums hit counts per entry
#[derive(Debug, Default)]
pub struct LineHitMerge;

#[async_trait]
impl MergeTool for LineHitMerge {
    async fn merge(
        &self,
        _sandbox: &dyn Sandbox,
        _handle: &SandboxHandle,
        inputs: &[PathBuf],
        output: &Path,
    ) -> HarvestResult<()> {
        let mut total = BTreeMap::new();
        for input in inputs {
            for (entry, hits) in read_hits(input)? {
                *total.entry(entry).or_insert(0) += hits;
            }
        }
        write_hits(output, &total)?;
        Ok(())
    }
}

/// Renders a line-hit profile into an index table
#[derive(Debug, Default)]
pub struct LineHitRenderer;

#[async_trait]
impl ReportRenderer for LineHitRenderer {
    async fn render(
        &self,
        _sandbox: &dyn Sandbox,
        _handle: &SandboxHandle,
        profile: &Path,
        output_dir: &Path,
    ) -> HarvestResult<PathBuf> {
        let mut per_file: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for (entry, hits) in read_hits(profile)? {
            let file = entry
                .rsplit_once(':')
                .map_or(entry.as_str(), |(file, _)| file)
                .to_string();
            let counts = per_file.entry(file).or_insert((0, 0));
            counts.1 += 1;
            if hits > 0 {
                counts.0 += 1;
            }
        }
        fs::create_dir_all(output_dir)?;
        let index = output_dir.join("index.html");
        fs::write(&index, index_html(&per_file))?;
        Ok(index)
    }
}

pub fn index_html(per_file: &BTreeMap<String, (u64, u64)>) -> String {
    let mut html = String::from(
        "<!doctype html><html><body><table>\n<tr><td>Filename</td><td>Function Coverage</td>\
         <td>Line Coverage</td><td>Region Coverage</td></tr>\n",
    );
    for (file, (covered, total)) in per_file {
        let _ = writeln!(
            html,
            "<tr><td><pre><a href='coverage/{file}.html'>{file}</a></pre></td>\
             <td><pre>(1/1)</pre></td><td><pre>({covered}/{total})</pre></td>\
             <td><pre>(0/0)</pre></td></tr>"
        );
    }
    html.push_str("</table></body></html>");
    html
}

pub fn read_hits(path: &Path) -> HarvestResult<BTreeMap<String, u64>> {
    let mut hits = BTreeMap::new();
    for line in fs::read_to_string(path)?.lines() {
        let Some((entry, count)) = line.rsplit_once(' ') else {
            continue;
        };
        let count: u64 = count
            .trim()
            .parse()
            .map_err(|_| HarvestError::merge(format!("malformed profile line: {line}")))?;
        *hits.entry(entry.to_string()).or_insert(0) += count;
    }
    Ok(hits)
}

pub fn write_hits(path: &Path, hits: &BTreeMap<String, u64>) -> HarvestResult<()> {
    let body: String = hits.iter().map(|(k, v)| format!("{k} {v}\n")).collect();
    fs::write(path, body)?;
    Ok(())
}

/// Shell program that records the given profile entries
pub fn unit_script(entries: &[(&str, u64)]) -> String {
    let mut script = String::from("#!/bin/sh\n: > \"$LLVM_PROFILE_FILE\"\n");
    for (entry, hits) in entries {
        let _ = writeln!(script, "echo '{entry} {hits}' >> \"$LLVM_PROFILE_FILE\"");
    }
    script
}

/// Write `body` to `dir/name` with a modification time `offset` seconds
/// after `base`
pub fn write_at(dir: &Path, name: &str, body: &str, base: SystemTime, offset: u64) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, body).unwrap();
    let file = fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(base + Duration::from_secs(offset)).unwrap();
    path
}

/// Fixed base time so bucket offsets do not depend on the wall clock
pub fn base_time() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

/// Local-sandbox configuration running shell units
pub fn shell_config(target: &Path, output_root: &Path) -> HarvestConfig {
    let mut config = HarvestConfig::new()
        .with_target(target)
        .with_output_root(output_root)
        .with_baseline("acetest")
        .with_interval_secs(60)
        .with_workers(2)
        .with_timeout_secs(5)
        .with_command(vec!["sh".to_string(), "{input}".to_string()]);
    config.source_extensions = vec!["sh".to_string()];
    config.sandbox.kind = SandboxKind::Local;
    config
}
