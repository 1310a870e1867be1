//! Final merge across worker accumulators.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, instrument};

use crate::error::CoordinatorError;
use crate::merge_tool::{MergeTool, MergeToolError};

/// Merges every existing accumulator into the final artifact.
pub struct FinalAggregator<'a> {
    tool: &'a dyn MergeTool,
    output: PathBuf,
}

impl<'a> FinalAggregator<'a> {
    /// Aggregator writing `output` through `tool`.
    #[must_use]
    pub fn new(tool: &'a dyn MergeTool, output: PathBuf) -> Self {
        Self { tool, output }
    }

    /// Final artifact path.
    #[must_use]
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Merge the accumulators that exist among `candidates`.
    ///
    /// Must only run once every worker has exited. The output is written to a
    /// temporary sibling and renamed into place, so it either appears whole
    /// or not at all.
    ///
    /// # Errors
    /// [`CoordinatorError::NoDataCollected`] if no candidate exists (no file is
    /// created), [`CoordinatorError::FinalMergeFailed`] if the merge fails.
    #[instrument(skip_all, fields(output = %self.output.display()))]
    pub fn aggregate(&self, candidates: &[PathBuf]) -> Result<PathBuf, CoordinatorError> {
        let mut inputs: Vec<PathBuf> = candidates.iter().filter(|p| p.is_file()).cloned().collect();
        if inputs.is_empty() {
            return Err(CoordinatorError::NoDataCollected {
                workers: candidates.len(),
            });
        }
        // Stable input order for identical reruns.
        inputs.sort();

        if let Some(parent) = self.output.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let tmp = tmp_sibling(&self.output);
        let failed = |source: MergeToolError| CoordinatorError::FinalMergeFailed {
            output: self.output.clone(),
            source,
        };
        if let Err(e) = self.tool.merge(&inputs, &tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(failed(e));
        }
        if let Err(e) = fs::rename(&tmp, &self.output) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        info!(accumulators = inputs.len(), "final artifact written");
        Ok(self.output.clone())
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use crate::worker::accumulator::tests::LineUnionTool;

    #[test]
    fn no_existing_accumulator_is_no_data_and_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("merged.profdata");
        let agg = FinalAggregator::new(&LineUnionTool, out.clone());
        let candidates = vec![dir.path().join("worker-00.profdata"), dir.path().join("worker-01.profdata")];

        let err = agg.aggregate(&candidates).unwrap_err();
        assert!(matches!(err, CoordinatorError::NoDataCollected { workers: 2 }));
        assert!(!out.exists());
    }

    #[test]
    fn merges_only_existing_accumulators() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("worker-00.profdata");
        let c = dir.path().join("worker-02.profdata");
        fs::write(&a, "A\n").unwrap();
        fs::write(&c, "C\n").unwrap();
        let out = dir.path().join("out/merged.profdata");
        let agg = FinalAggregator::new(&LineUnionTool, out.clone());

        let written = agg
            .aggregate(&[a, dir.path().join("worker-01.profdata"), c])
            .unwrap();
        assert_eq!(written, out);
        assert_eq!(fs::read_to_string(&out).unwrap(), "A\nC\n");
    }

    #[test]
    fn rerun_over_unchanged_accumulators_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("worker-00.profdata");
        let b = dir.path().join("worker-01.profdata");
        fs::write(&a, "X\nA\n").unwrap();
        fs::write(&b, "B\nX\n").unwrap();
        let out = dir.path().join("merged.profdata");
        let agg = FinalAggregator::new(&LineUnionTool, out.clone());

        agg.aggregate(&[a.clone(), b.clone()]).unwrap();
        let first = fs::read(&out).unwrap();
        agg.aggregate(&[b, a]).unwrap();
        assert_eq!(fs::read(&out).unwrap(), first);
    }

    #[test]
    fn merge_failure_is_final_merge_failed_and_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("worker-00.profdata");
        fs::write(&a, "CORRUPT\n").unwrap();
        let out = dir.path().join("merged.profdata");
        let agg = FinalAggregator::new(&LineUnionTool, out.clone());

        let err = agg.aggregate(&[a]).unwrap_err();
        assert!(matches!(err, CoordinatorError::FinalMergeFailed { .. }));
        assert!(!out.exists());
        assert!(!tmp_sibling(&out).exists());
    }
}
