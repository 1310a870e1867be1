//! External merge operation.
//!
//! The coordinator never interprets profile data itself. Every merge, whether
//! a worker folding one raw file into its accumulator or the final
//! aggregation across accumulators, goes through a [`MergeTool`]. The
//! production implementation shells out to `llvm-profdata merge`; tests
//! substitute an in-process tool with the same contract: given any set of
//! inputs, write one output that is their associative, commutative merge.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::MergeConfig;

/// Failure of a single merge invocation.
#[derive(Debug, Error)]
pub enum MergeToolError {
    /// The tool could not be started at all.
    #[error(
        "failed to run merge tool '{program}': {source}\n  \
         To fix: install it or set `[merge] tool` in profmerge.toml."
    )]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and reported failure.
    #[error("merge tool '{program}' exited with {}: {stderr}", describe_code(*code))]
    Exit {
        /// Program that failed.
        program: String,
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
        /// Trimmed standard error of the tool.
        stderr: String,
    },

    /// The tool reported success but the output is missing.
    #[error("merge tool '{program}' reported success but {} was not written", output.display())]
    MissingOutput {
        /// Program that ran.
        program: String,
        /// Expected output path.
        output: PathBuf,
    },
}

fn describe_code(code: Option<i32>) -> String {
    code.map_or_else(|| "a signal".to_owned(), |c| format!("code {c}"))
}

/// Merges a set of profile files into one output file.
pub trait MergeTool: Send + Sync {
    /// Merge `inputs` into `output`, overwriting it if present.
    ///
    /// # Errors
    /// Returns [`MergeToolError`] if the merge did not produce `output`.
    fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeToolError>;
}

/// Runs `<program> <args...> -o <output> <inputs...>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalMergeTool {
    program: String,
    args: Vec<String>,
}

impl ExternalMergeTool {
    /// Tool invoked with `args` before `-o`.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Tool described by the `[merge]` table.
    #[must_use]
    pub fn from_config(config: &MergeConfig) -> Self {
        Self::new(config.tool.clone(), config.args.clone())
    }
}

impl MergeTool for ExternalMergeTool {
    #[instrument(skip_all, fields(tool = %self.program, inputs = inputs.len(), output = %output.display()))]
    fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeToolError> {
        let result = Command::new(&self.program)
            .args(&self.args)
            .arg("-o")
            .arg(output)
            .args(inputs)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| MergeToolError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !result.status.success() {
            return Err(MergeToolError::Exit {
                program: self.program.clone(),
                code: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_owned(),
            });
        }
        if !output.exists() {
            return Err(MergeToolError::MissingOutput {
                program: self.program.clone(),
                output: output.to_path_buf(),
            });
        }
        debug!("merge tool succeeded");
        Ok(())
    }
}
