//! Coordinator configuration (`profmerge.toml`).
//!
//! Defines the typed configuration for the coordinator, the control protocol,
//! the external merge tool, and the optional report step. Every field has a
//! default, so an absent file is the same as an empty one.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::ControlProtocol;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "profmerge.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level profmerge configuration.
///
/// Parsed from `profmerge.toml`. Missing fields use defaults.
/// Missing file → all defaults (no error).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfmergeConfig {
    /// Pool, lock, and output locations.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Control-plane socket settings shared by server and clients.
    #[serde(default)]
    pub control: ControlConfig,

    /// External merge tool invocation.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Optional coverage report step.
    #[serde(default)]
    pub report: ReportConfig,
}

// ---------------------------------------------------------------------------
// CoordinatorConfig
// ---------------------------------------------------------------------------

/// Pool size, isolation, and on-disk locations.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Directory receiving the final artifact, report, and detached log.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Final artifact file name, relative to `output_dir` unless absolute.
    #[serde(default = "default_final_artifact")]
    pub final_artifact: PathBuf,

    /// Scratch directory holding worker accumulators, relative to
    /// `output_dir` unless absolute. Removed when the coordinator exits.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Singleton lock file. Shared by every coordinator on the host, so it
    /// defaults to the system temp directory rather than `output_dir`.
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Number of merge workers in the pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How workers are isolated from the coordinator.
    #[serde(default)]
    pub isolation: Isolation,

    /// How many times a slot relaunches a crashed worker before retiring.
    #[serde(default = "default_max_worker_restarts")]
    pub max_worker_restarts: u32,

    /// Leave the scratch directory on disk after the run (debugging aid).
    #[serde(default)]
    pub keep_scratch: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            final_artifact: default_final_artifact(),
            scratch_dir: default_scratch_dir(),
            lock_file: default_lock_file(),
            workers: default_workers(),
            isolation: Isolation::default(),
            max_worker_restarts: default_max_worker_restarts(),
            keep_scratch: false,
        }
    }
}

impl CoordinatorConfig {
    /// Resolved path of the final artifact.
    #[must_use]
    pub fn final_artifact_path(&self) -> PathBuf {
        self.output_dir.join(&self.final_artifact)
    }

    /// Resolved path of the scratch directory.
    #[must_use]
    pub fn scratch_path(&self) -> PathBuf {
        self.output_dir.join(&self.scratch_dir)
    }

    /// Log file used when the coordinator detaches into the background.
    #[must_use]
    pub fn detached_log_path(&self) -> PathBuf {
        self.output_dir.join("profmerge.log")
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_final_artifact() -> PathBuf {
    PathBuf::from("merged.profdata")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from(".profmerge-work")
}

fn default_lock_file() -> PathBuf {
    std::env::temp_dir().join("profmerge.pid")
}

const fn default_workers() -> usize {
    10
}

const fn default_max_worker_restarts() -> u32 {
    3
}

/// Worker isolation mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Isolation {
    /// Each worker is a child process; a crash cannot reach siblings.
    #[default]
    Process,
    /// Each worker runs inside its slot thread (debugging, tests).
    Thread,
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Thread => write!(f, "thread"),
        }
    }
}

// ---------------------------------------------------------------------------
// ControlConfig
// ---------------------------------------------------------------------------

/// Control-plane socket settings.
///
/// Both `profmerge start` and the `stop`/`ingest` clients read this table,
/// so the address and sentinel always agree.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlConfig {
    /// TCP address the listener binds and clients connect to.
    #[serde(default = "default_address")]
    pub address: String,

    /// Payload that requests shutdown. The default contains NUL bytes, which
    /// no filesystem path can, so it never collides with an ingest message.
    #[serde(default = "default_sentinel")]
    pub shutdown_sentinel: String,

    /// Largest accepted message, in bytes.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Per-connection read timeout, in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Client connect attempts (100ms apart) before giving up.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            shutdown_sentinel: default_sentinel(),
            max_message_bytes: default_max_message_bytes(),
            read_timeout_ms: default_read_timeout_ms(),
            connect_retries: default_connect_retries(),
        }
    }
}

impl ControlConfig {
    /// Build the protocol contract shared by listener and clients.
    #[must_use]
    pub fn protocol(&self) -> ControlProtocol {
        ControlProtocol {
            address: self.address.clone(),
            sentinel: self.shutdown_sentinel.as_bytes().to_vec(),
            max_message_bytes: self.max_message_bytes,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            connect_retries: self.connect_retries,
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:12400".to_owned()
}

fn default_sentinel() -> String {
    "\0PROFMERGE_TESTS_FINISHED\0".to_owned()
}

const fn default_max_message_bytes() -> usize {
    4096
}

const fn default_read_timeout_ms() -> u64 {
    5000
}

const fn default_connect_retries() -> u32 {
    20
}

// ---------------------------------------------------------------------------
// MergeConfig
// ---------------------------------------------------------------------------

/// External merge tool settings.
///
/// The tool is invoked as `<tool> <args...> -o <output> <inputs...>`, which
/// matches `llvm-profdata merge`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    /// Program to run (looked up on `PATH` if not absolute).
    #[serde(default = "default_tool")]
    pub tool: String,

    /// Arguments placed before `-o`.
    #[serde(default = "default_tool_args")]
    pub args: Vec<String>,

    /// Delete each raw file once it has been merged successfully.
    #[serde(default = "default_remove_raw_files")]
    pub remove_raw_files: bool,

    /// What a worker does after a per-file failure.
    #[serde(default)]
    pub on_failure: OnMergeFailure,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            tool: default_tool(),
            args: default_tool_args(),
            remove_raw_files: default_remove_raw_files(),
            on_failure: OnMergeFailure::default(),
        }
    }
}

fn default_tool() -> String {
    "llvm-profdata".to_owned()
}

fn default_tool_args() -> Vec<String> {
    vec!["merge".to_owned()]
}

const fn default_remove_raw_files() -> bool {
    true
}

/// Action a worker takes when a single raw file cannot be merged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnMergeFailure {
    /// Log a warning, drop the file's contribution, keep consuming.
    #[default]
    Skip,
    /// Stop this worker; siblings keep consuming the queue.
    AbortWorker,
}

impl fmt::Display for OnMergeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip => write!(f, "skip"),
            Self::AbortWorker => write!(f, "abort-worker"),
        }
    }
}

// ---------------------------------------------------------------------------
// ReportConfig
// ---------------------------------------------------------------------------

/// Optional coverage report step.
///
/// Runs only when both `comparator` and `binary` are set.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    /// Comparison utility (e.g. `cov-compare`).
    pub comparator: Option<PathBuf>,

    /// Binary under test the profile data belongs to.
    pub binary: Option<PathBuf>,

    /// Report format passed as the comparator's first argument.
    #[serde(default = "default_report_format")]
    pub format: String,

    /// Report file name inside `output_dir`.
    #[serde(default = "default_report_name")]
    pub report_name: String,

    /// Archive file name inside `output_dir`.
    #[serde(default = "default_archive_name")]
    pub archive_name: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            comparator: None,
            binary: None,
            format: default_report_format(),
            report_name: default_report_name(),
            archive_name: default_archive_name(),
        }
    }
}

impl ReportConfig {
    /// Returns `true` if both the comparator and the binary are configured.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.comparator.is_some() && self.binary.is_some()
    }
}

fn default_report_format() -> String {
    "yaml".to_owned()
}

fn default_report_name() -> String {
    "coverage.yaml".to_owned()
}

fn default_archive_name() -> String {
    "coverage.tar.gz".to_owned()
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Error loading or validating a profmerge configuration file.
#[derive(Debug)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<PathBuf>,
    /// Human-readable message with line-level detail when possible.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl ProfmergeConfig {
    /// Load configuration from a TOML file and validate it.
    ///
    /// - If the file does not exist, returns all defaults (not an error).
    /// - If the file exists but contains invalid TOML or unknown fields,
    ///   returns a [`ConfigError`] with line-level detail.
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found), parse
    /// errors, or failed validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML, unknown fields, or failed
    /// validation.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check cross-field constraints that serde cannot express.
    ///
    /// # Errors
    /// Returns `ConfigError` describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |message: String| {
            Err(ConfigError {
                path: None,
                message,
            })
        };
        if self.coordinator.workers == 0 {
            return fail("coordinator.workers must be at least 1".to_owned());
        }
        if self.control.shutdown_sentinel.is_empty() {
            return fail("control.shutdown_sentinel must not be empty".to_owned());
        }
        if self.control.max_message_bytes < self.control.shutdown_sentinel.len() {
            return fail(format!(
                "control.max_message_bytes ({}) is smaller than the shutdown sentinel ({} bytes)",
                self.control.max_message_bytes,
                self.control.shutdown_sentinel.len()
            ));
        }
        if self.merge.tool.trim().is_empty() {
            return fail("merge.tool must not be empty".to_owned());
        }
        self.validate_scratch_dir()
    }

    /// Scratch must be a subdirectory of its own, holding none of the run's
    /// outputs.
    fn validate_scratch_dir(&self) -> Result<(), ConfigError> {
        let settings = &self.coordinator;
        let dir = &settings.scratch_dir;
        let names_a_directory = dir.components().any(|c| matches!(c, Component::Normal(_)));
        let climbs = dir.components().any(|c| matches!(c, Component::ParentDir));
        if !names_a_directory || climbs {
            return Err(ConfigError {
                path: None,
                message: format!(
                    "coordinator.scratch_dir {:?} must name a dedicated subdirectory \
                     (not empty, not `.`, no `..`)",
                    dir.display().to_string()
                ),
            });
        }

        let scratch = lexical(&settings.scratch_path());
        let protected = [
            ("coordinator.output_dir", settings.output_dir.clone()),
            ("coordinator.final_artifact", settings.final_artifact_path()),
            ("coordinator.lock_file", settings.lock_file.clone()),
        ];
        for (field, path) in protected {
            if lexical(&path).starts_with(&scratch) {
                return Err(ConfigError {
                    path: None,
                    message: format!(
                        "coordinator.scratch_dir ({}) contains {field} ({}); \
                         pick a scratch directory of its own",
                        scratch.display(),
                        path.display()
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Absolute form of `path` without touching the filesystem.
fn lexical(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
