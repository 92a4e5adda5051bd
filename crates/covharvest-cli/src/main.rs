//! covharvest: bucketed coverage harvesting
//!
//! ## Usage
//!
//! ```bash
//! covharvest run corpus/acetest --dll torch --ver 2.2.0 -i 60 -j 8
//! covharvest run --config harvest.yaml --require aten/src
//! covharvest classify corpus/acetest -i 120
//! covharvest extract _result/acetest/0-60/report.html --require native
//! ```

use clap::Parser;
use covharvest_cli::{
    handlers, logging, Cli, CliConfig, CliResult, ColorChoice, Commands, Verbosity,
};
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = build_config(&cli);
    logging::init(config.verbosity);

    match run(&cli, &config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, config: &CliConfig) -> CliResult<bool> {
    match cli.command {
        Commands::Run(ref args) => handlers::run_harvest(config, args),
        Commands::Classify(ref args) => handlers::run_classify(config, args).map(|()| true),
        Commands::Extract(ref args) => handlers::run_extract(config, args).map(|()| true),
    }
}

fn build_config(cli: &Cli) -> CliConfig {
    let color: ColorChoice = cli.color.clone().into();
    CliConfig::new()
        .with_verbosity(Verbosity::from_flags(cli.quiet, cli.verbose))
        .with_color(color)
}
