use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use profmerge::CoordinatorError;
use profmerge::config::{DEFAULT_CONFIG_FILE, ProfmergeConfig};

mod client_cmd;
mod start_cmd;
mod worker_cmd;

/// Profile data merge coordinator
///
/// Collects raw profiling dumps from a parallel test run and merges them
/// through a pool of long-lived workers, then aggregates the workers'
/// results into one final artifact.
///
/// QUICK START:
///
///   profmerge start --output-dir build/coverage
///
///   # From each test process, once its raw file is written:
///   profmerge ingest /abs/path/to/test-1234.profraw
///
///   # After the test run:
///   profmerge stop
///
/// The final artifact is written to <output-dir>/merged.profdata.
///
/// EXIT CODES:
///
///   3  another coordinator holds the lock
///   4  no profiling data was collected
///   5  the final merge failed
#[derive(Parser)]
#[command(name = "profmerge")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'profmerge <command> --help' for more information on a specific command.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator
    ///
    /// Detaches into the background and prints the coordinator pid, unless
    /// --foreground is given.
    Start(start_cmd::StartArgs),

    /// Ask the running coordinator to drain and write the final artifact
    Stop(client_cmd::StopArgs),

    /// Send raw files to the running coordinator for merging
    Ingest(client_cmd::IngestArgs),

    /// Merge worker process (started by the coordinator)
    #[command(hide = true)]
    Worker(worker_cmd::WorkerArgs),
}

/// `--config` shared by every subcommand that reads profmerge.toml.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Path to the config file
    #[arg(long, env = "PROFMERGE_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
}

impl ConfigArgs {
    /// Load the config file (defaults if it does not exist).
    pub fn load(&self) -> Result<ProfmergeConfig> {
        Ok(ProfmergeConfig::load(&self.config)?)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _telemetry = profmerge::telemetry::init();

    let result = match cli.command {
        Commands::Start(ref args) => start_cmd::run(args),
        Commands::Stop(ref args) => client_cmd::stop(args),
        Commands::Ingest(ref args) => client_cmd::ingest(args),
        Commands::Worker(args) => worker_cmd::run(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<CoordinatorError>()
        .map_or(1, |e| u8::try_from(e.exit_code()).unwrap_or(1))
}
