//! Optional coverage report and its archive.
//!
//! Runs the configured comparator against the final artifact and the binary
//! under test, then packs the report as a gzip-compressed tarball. Nothing in
//! here can fail the run: every problem becomes [`ReportOutcome::Failed`].

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::ReportConfig;

/// Result of the report step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportOutcome {
    /// Comparator or binary not configured.
    Skipped,
    /// Report written and archived.
    Generated {
        /// Report file.
        report: PathBuf,
        /// Archive containing the report.
        archive: PathBuf,
    },
    /// The comparator or packaging failed; the final artifact is unaffected.
    Failed {
        /// What went wrong.
        reason: String,
    },
}

/// Runs `<comparator> <format> <final_artifact> <binary> -o <report>`.
#[derive(Clone, Debug)]
pub struct ReportGenerator {
    comparator: PathBuf,
    binary: PathBuf,
    format: String,
    report: PathBuf,
    archive: PathBuf,
}

impl ReportGenerator {
    /// Generator from the `[report]` table, or `None` if it is disabled.
    #[must_use]
    pub fn from_config(config: &ReportConfig, output_dir: &Path) -> Option<Self> {
        let (Some(comparator), Some(binary)) = (&config.comparator, &config.binary) else {
            return None;
        };
        Some(Self {
            comparator: comparator.clone(),
            binary: binary.clone(),
            format: config.format.clone(),
            report: output_dir.join(&config.report_name),
            archive: output_dir.join(&config.archive_name),
        })
    }

    /// Produce and archive the report for `final_artifact`.
    #[instrument(skip_all, fields(comparator = %self.comparator.display()))]
    pub fn generate(&self, final_artifact: &Path) -> ReportOutcome {
        match self.try_generate(final_artifact) {
            Ok(()) => {
                info!(report = %self.report.display(), archive = %self.archive.display(), "coverage report archived");
                ReportOutcome::Generated {
                    report: self.report.clone(),
                    archive: self.archive.clone(),
                }
            }
            Err(reason) => {
                warn!(stage = "report", %reason, "coverage report skipped");
                ReportOutcome::Failed { reason }
            }
        }
    }

    fn try_generate(&self, final_artifact: &Path) -> Result<(), String> {
        let output = Command::new(&self.comparator)
            .arg(&self.format)
            .arg(final_artifact)
            .arg(&self.binary)
            .arg("-o")
            .arg(&self.report)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| format!("failed to run {}: {e}", self.comparator.display()))?;
        if !output.status.success() {
            return Err(format!(
                "{} exited with {}: {}",
                self.comparator.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        if !self.report.is_file() {
            return Err(format!("comparator did not write {}", self.report.display()));
        }
        archive_file(&self.report, &self.archive)
            .map_err(|e| format!("failed to write {}: {e}", self.archive.display()))
    }
}

/// Write `file` into a new gzip (level 9) tarball at `archive`, stored under
/// its file name.
///
/// # Errors
/// Returns any I/O error while reading `file` or writing `archive`.
pub fn archive_file(file: &Path, archive: &Path) -> io::Result<()> {
    let name = file
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "report path has no file name"))?;
    let out = BufWriter::new(File::create(archive)?);
    let mut builder = tar::Builder::new(GzEncoder::new(out, Compression::best()));
    builder.append_path_with_name(file, name)?;
    let gz = builder.into_inner()?;
    gz.finish()?.flush()
}
