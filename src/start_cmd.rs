use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Args;
use tracing::info;

use profmerge::config::ProfmergeConfig;
use profmerge::protocol::ControlClient;
use profmerge::telemetry::{LOG_FORMAT_ENV, LogFormat};
use profmerge::{Coordinator, CoordinatorError, RunSummary, lock, signals};

use crate::ConfigArgs;

/// How long `start` waits for a detached coordinator to take the lock.
const DETACH_READY_TIMEOUT: Duration = Duration::from_secs(10);
const DETACH_POLL: Duration = Duration::from_millis(50);

#[derive(Args, Debug)]
pub struct StartArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Directory for the final artifact, report, and log
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Number of merge workers
    #[arg(long, short = 'j')]
    pub workers: Option<usize>,

    /// Binary under test (enables the coverage report with --comparator)
    #[arg(long)]
    pub binary: Option<PathBuf>,

    /// Coverage comparison utility (enables the report with --binary)
    #[arg(long)]
    pub comparator: Option<PathBuf>,

    /// Keep raw files after merging them
    #[arg(long)]
    pub no_remove: bool,

    /// Run in this process instead of detaching
    #[arg(long)]
    pub foreground: bool,

    /// Summary format: text or json
    ///
    /// Defaults to json when PROFMERGE_LOG_FORMAT=json, text otherwise.
    #[arg(long)]
    pub format: Option<SummaryFormat>,
}

/// How the run summary is printed once the coordinator finishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SummaryFormat {
    Text,
    Json,
}

impl FromStr for SummaryFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("invalid format '{s}'. Use: text or json")),
        }
    }
}

impl SummaryFormat {
    fn resolve(flag: Option<Self>) -> Self {
        flag.unwrap_or_else(|| {
            match LogFormat::parse(std::env::var(LOG_FORMAT_ENV).ok().as_deref()) {
                LogFormat::Json => Self::Json,
                LogFormat::Text => Self::Text,
            }
        })
    }

    fn render(self, summary: &RunSummary) -> Result<String> {
        match self {
            Self::Json => {
                serde_json::to_string(summary).context("failed to serialize the run summary")
            }
            Self::Text => Ok(format!(
                "merged {} raw file(s) into {} ({} dropped)",
                summary.merged(),
                summary.final_artifact.display(),
                summary.dropped()
            )),
        }
    }
}

impl StartArgs {
    fn resolve_config(&self) -> Result<ProfmergeConfig> {
        let mut config = self.config.load()?;
        if let Some(dir) = &self.output_dir {
            config.coordinator.output_dir.clone_from(dir);
        }
        if let Some(workers) = self.workers {
            config.coordinator.workers = workers;
        }
        if let Some(binary) = &self.binary {
            config.report.binary = Some(binary.clone());
        }
        if let Some(comparator) = &self.comparator {
            config.report.comparator = Some(comparator.clone());
        }
        if self.no_remove {
            config.merge.remove_raw_files = false;
        }
        config.validate()?;
        Ok(config)
    }
}

pub fn run(args: &StartArgs) -> Result<()> {
    let config = args.resolve_config()?;
    if args.foreground {
        run_foreground(config, SummaryFormat::resolve(args.format))
    } else {
        detach(&config)
    }
}

fn run_foreground(config: ProfmergeConfig, format: SummaryFormat) -> Result<()> {
    let running = Coordinator::new(config).start()?;
    let client = ControlClient::new(running.client_protocol()?);
    signals::forward_to_shutdown(client).context("failed to install signal handlers")?;

    let summary = running.serve_until_shutdown()?;
    println!("{}", format.render(&summary)?);
    Ok(())
}

/// Re-run `start --foreground` in the background and wait until it owns the
/// lock.
fn detach(config: &ProfmergeConfig) -> Result<()> {
    let lock_file = &config.coordinator.lock_file;
    if lock_file.exists() {
        return Err(CoordinatorError::LockContention {
            pid: lock::read_owner(lock_file),
            path: lock_file.clone(),
        }
        .into());
    }

    std::fs::create_dir_all(&config.coordinator.output_dir).with_context(|| {
        format!(
            "failed to create output directory {}",
            config.coordinator.output_dir.display()
        )
    })?;
    let log_path = config.coordinator.detached_log_path();
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open log file {}", log_path.display()))?;

    let exe = std::env::current_exe().context("cannot locate the profmerge executable")?;
    let mut cmd = Command::new(exe);
    cmd.args(std::env::args_os().skip(1))
        .arg("--foreground")
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        cmd.process_group(0);
    }
    let mut child = cmd.spawn().context("failed to start background coordinator")?;
    let pid = child.id();

    let deadline = Instant::now() + DETACH_READY_TIMEOUT;
    loop {
        if lock::read_owner(lock_file) == pid.to_string() {
            break;
        }
        if let Some(status) = child.try_wait()? {
            bail!(
                "background coordinator exited during startup ({status}).\n  \
                 See the log: {}",
                log_path.display()
            );
        }
        if Instant::now() >= deadline {
            bail!(
                "background coordinator (pid {pid}) did not take the lock within {}s.\n  \
                 See the log: {}",
                DETACH_READY_TIMEOUT.as_secs(),
                log_path.display()
            );
        }
        thread::sleep(DETACH_POLL);
    }

    info!(pid, log = %log_path.display(), "coordinator detached");
    println!("{pid}");
    Ok(())
}
