mod collector;
mod config;
mod ingest;
mod pipeline;
mod sink;
mod store;

use benchtrail_analysis::{Evaluation, Finding};
use benchtrail_ingest::{IngestError, Suite};
use clap::{Parser, Subcommand};
use collector::Collector;
use config::{ConfigErrors, RunnerConfig, StoreConfig};
use ingest::Adapters;
use itertools::Itertools;
use pipeline::{IngestOptions, Pipeline, RunnerError};
use rayon::prelude::*;
use sink::AlertSink;
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};
use store::StorageAdapters;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about, version, name = "benchtrail")]
/// Merge benchmark runs into a durable history and flag performance regressions
struct Cli {
    /// YAML configuration
    #[arg(short, long, default_value = "benchtrail.yml")]
    config: PathBuf,
    /// Use this store instead of the configured one, `.db`/`.sqlite` select SQLite
    #[arg(short, long)]
    store: Option<PathBuf>,
    /// Log debug output
    #[arg(short, long)]
    verbose: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Merge run files into the history and evaluate them
    Ingest {
        /// Suite to merge into, inferred from the measurement names otherwise
        #[arg(long)]
        suite: Option<String>,
        /// Configured adapter normalizing the inputs
        #[arg(long)]
        adapter: Option<String>,
        /// Files picked up from directory inputs
        #[arg(long)]
        glob: Option<String>,
        /// Date (epoch millis) of runs that carry none
        #[arg(long)]
        date: Option<u64>,
        /// Run files or directories
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Evaluate the latest run of every suite again
    Check {
        #[arg(long)]
        suite: Option<String>,
    },
    /// Load the history and report its size
    Verify,
    /// Write the history as a dashboard document (`.js` or `.json`)
    Export { output: PathBuf },
}

enum Outcome {
    Clean,
    Regressions(usize),
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Path, store: Option<PathBuf>) -> Result<RunnerConfig, ConfigErrors> {
    let mut config = if path.is_file() {
        RunnerConfig::load(path)?
    } else if let Some(store) = &store {
        info!(
            "No config at {}, using defaults for {}",
            path.to_string_lossy(),
            store.to_string_lossy()
        );

        RunnerConfig::from_store(StoreConfig::from_path(store.clone()))
    } else {
        return Err(ConfigErrors::FileNotFound(path.to_path_buf()));
    };

    if let Some(store) = store {
        config.store = StoreConfig::from_path(store);
    }

    if config.preflight_checks() {
        return Err(ConfigErrors::Invalid);
    }

    Ok(config)
}

fn outcome(config: &RunnerConfig, findings: usize) -> Outcome {
    if findings > 0 && config.alert.fail_on_regression {
        Outcome::Regressions(findings)
    } else {
        Outcome::Clean
    }
}

fn run(cli: Cli) -> Result<Outcome, RunnerError> {
    let config = load_config(&cli.config, cli.store)?;
    let store = StorageAdapters::open(&config.store, config.timeout())?;

    match cli.command {
        Command::Ingest {
            suite,
            adapter,
            glob,
            date,
            inputs,
        } => {
            let adapters = Adapters::load_all(&config.ingest);
            let adapter = Adapters::select(&adapters, adapter.as_deref())?;
            let collector =
                Collector::load(&inputs, glob.as_deref().unwrap_or(&config.collect.glob))?;
            let sink = AlertSink::open(&config.alert).map_err(RunnerError::AlertOutput)?;

            if collector.size_hint().0 == 0 {
                warn!("No run files found");
            }

            let results = Pipeline::new(&config, &store, &sink).ingest_all(
                collector,
                &adapter,
                &IngestOptions { suite, date },
            )?;

            let failed = results.iter().filter(|(_, result)| result.is_err()).count();
            let findings = results
                .iter()
                .filter_map(|(_, result)| result.as_ref().ok())
                .map(|ingested| ingested.findings.len())
                .sum::<usize>();

            info!(files = results.len(), failed, findings, "Finished ingestion");

            if failed > 0 {
                return Err(RunnerError::Incomplete(failed));
            }

            Ok(outcome(&config, findings))
        }
        Command::Check { suite } => {
            let history = store.load()?.history;
            let names = match &suite {
                Some(suite) => vec![suite.as_str()],
                None => history.suites().iter().map(Suite::name).collect_vec(),
            };
            let sink = AlertSink::open(&config.alert).map_err(RunnerError::AlertOutput)?;

            let findings = names
                .par_iter()
                .map(|name| {
                    Evaluation::latest(&config.regression, &history, name)
                        .map(|evaluation| evaluation.findings().collect_vec())
                })
                .collect::<Result<Vec<Vec<Finding>>, IngestError>>()?
                .into_iter()
                .flatten()
                .collect_vec();

            info!(suites = names.len(), findings = findings.len(), "Checked latest runs");
            sink.emit(&findings);

            Ok(outcome(&config, findings.len()))
        }
        Command::Verify => {
            let history = store.load()?.history;

            for suite in history.suites() {
                println!(
                    "{}\t{} runs\tlatest {}",
                    suite.name(),
                    suite.len(),
                    suite.latest().map_or(0, |run| run.date)
                );
            }

            info!(
                suites = history.suites().len(),
                runs = history.run_count(),
                last_update = history.last_update(),
                "History is consistent"
            );

            Ok(Outcome::Clean)
        }
        Command::Export { output } => {
            let history = store.load()?.history;
            store::file::export(&output, &history)?;

            info!(
                output = ?output,
                runs = history.run_count(),
                "Exported history"
            );

            Ok(Outcome::Clean)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(Outcome::Clean) => ExitCode::SUCCESS,
        Ok(Outcome::Regressions(findings)) => {
            error!("Found {findings} regressions");

            ExitCode::from(2)
        }
        Err(error) => {
            error!("{error}");

            ExitCode::FAILURE
        }
    }
}
