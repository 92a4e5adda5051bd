//! Subcommand implementations

use crate::commands::{ClassifyArgs, ExtractArgs, RunArgs};
use crate::config::CliConfig;
use crate::error::{CliError, CliResult};
use crate::output::ProgressReporter;
use covharvest::{Bucketizer, CoverageExtractor, Pipeline, Shutdown};
use std::sync::Arc;
use tracing::warn;

/// `covharvest run`; returns whether every bucket finished without a hard
/// failure
pub fn run_harvest(config: &CliConfig, args: &RunArgs) -> CliResult<bool> {
    let harvest = args.resolve()?;
    if harvest.target.as_os_str().is_empty() {
        return Err(CliError::invalid_argument(
            "A target directory is required (positional or `target:` in --config)",
        ));
    }

    let reporter = Arc::new(ProgressReporter::new(
        config.color.should_color(),
        config.verbosity.is_quiet(),
    ));
    let shutdown = Shutdown::new();
    let pipeline = Pipeline::from_config(harvest)?
        .with_shutdown(shutdown.clone())
        .with_observer(reporter.clone());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let summary = runtime.block_on(async {
        let interrupt = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after running units exit");
                interrupt.trigger();
            }
        });
        pipeline.run().await
    })?;

    if summary.is_empty() {
        reporter.warning("No buckets found, nothing to do");
        return Ok(true);
    }
    reporter.summary(&summary);
    if !config.verbosity.is_quiet() {
        print!("{}", summary.render_table());
    }
    Ok(summary.is_success())
}

/// `covharvest classify`
pub fn run_classify(config: &CliConfig, args: &ClassifyArgs) -> CliResult<()> {
    let output = args.output_dir();
    let classification = Bucketizer::new(&args.target, args.interval)?
        .with_extensions(&args.extensions)
        .with_filter(args.filter.as_deref())
        .classify_into(&output)?;

    if classification.is_empty() {
        if !config.verbosity.is_quiet() {
            println!("No source files found under {}", args.target.display());
        }
        return Ok(());
    }
    for (label, count) in classification.label_counts() {
        println!("{label:<16} {count}");
    }
    if !config.verbosity.is_quiet() {
        println!(
            "{} files into {} buckets under {}",
            classification.total(),
            classification.label_counts().len(),
            output.display()
        );
    }
    Ok(())
}

/// `covharvest extract`
pub fn run_extract(_config: &CliConfig, args: &ExtractArgs) -> CliResult<()> {
    let extractor = CoverageExtractor::new(args.parser.into(), args.required.clone());
    let report = extractor.extract_file(&args.report)?;
    if args.json {
        let value = serde_json::json!({
            "score": report.score(),
            "files": report.ranked(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        let title = args.report.display().to_string();
        print!("{}", report.render_summary(&title));
    }
    Ok(())
}
