//! A worker's private running merge result.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::merge_tool::MergeTool;

use super::FailureStage;

/// Accumulator location for a worker ordinal inside the scratch directory.
#[must_use]
pub fn accumulator_path(scratch: &Path, ordinal: usize) -> PathBuf {
    scratch.join(format!("worker-{ordinal:02}.profdata"))
}

/// Whether `name` is an accumulator (or an in-progress replacement of one)
/// as written by [`Accumulator::absorb`].
#[must_use]
pub fn is_accumulator_file(name: &str) -> bool {
    name.starts_with("worker-")
        && (name.ends_with(".profdata") || name.ends_with(".profdata.partial"))
}

/// Why one raw file could not be folded in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileFailure {
    /// Failing stage.
    pub stage: FailureStage,
    /// Human-readable cause.
    pub reason: String,
}

impl FileFailure {
    fn ingest(reason: String) -> Self {
        Self {
            stage: FailureStage::Ingest,
            reason,
        }
    }

    fn merge_tool(reason: String) -> Self {
        Self {
            stage: FailureStage::MergeTool,
            reason,
        }
    }
}

/// Accumulator file owned by exactly one worker.
///
/// Created lazily by the first successful merge. Each merge writes
/// `<path>.partial` and renames it over `<path>`, so the accumulator on disk
/// is always the result of some complete prefix of merges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Accumulator {
    ordinal: usize,
    path: PathBuf,
}

impl Accumulator {
    /// Accumulator for `ordinal` at `path`.
    #[must_use]
    pub const fn new(ordinal: usize, path: PathBuf) -> Self {
        Self { ordinal, path }
    }

    /// Owning worker's ordinal.
    #[must_use]
    pub const fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Accumulator file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` once at least one merge has succeeded.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn partial_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".partial");
        PathBuf::from(name)
    }

    /// Merge `raw` into the accumulator.
    ///
    /// On failure the accumulator is left exactly as it was.
    ///
    /// # Errors
    /// [`FailureStage::Ingest`] if `raw` cannot be opened as a regular file,
    /// [`FailureStage::MergeTool`] if the merge or the final rename fails.
    pub fn absorb(&self, raw: &Path, tool: &dyn MergeTool) -> Result<(), FileFailure> {
        let file = File::open(raw).map_err(|e| FileFailure::ingest(format!("cannot open: {e}")))?;
        let meta = file
            .metadata()
            .map_err(|e| FileFailure::ingest(format!("cannot stat: {e}")))?;
        if !meta.is_file() {
            return Err(FileFailure::ingest("not a regular file".to_owned()));
        }
        drop(file);

        let mut inputs = Vec::with_capacity(2);
        if self.exists() {
            inputs.push(self.path.clone());
        }
        inputs.push(raw.to_path_buf());

        let partial = self.partial_path();
        if let Err(e) = tool.merge(&inputs, &partial) {
            let _ = fs::remove_file(&partial);
            return Err(FileFailure::merge_tool(e.to_string()));
        }
        fs::rename(&partial, &self.path).map_err(|e| {
            let _ = fs::remove_file(&partial);
            FileFailure::merge_tool(format!(
                "cannot replace {}: {e}",
                self.path.display()
            ))
        })
    }
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
pub(crate) mod tests {
    use super::*;
    use crate::merge_tool::MergeToolError;
    use std::collections::BTreeSet;

    /// Sorted line union; fails on any input containing `CORRUPT`.
    pub(crate) struct LineUnionTool;

    impl MergeTool for LineUnionTool {
        fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeToolError> {
            let mut lines = BTreeSet::new();
            for input in inputs {
                let text = fs::read_to_string(input).map_err(|source| MergeToolError::Spawn {
                    program: "line-union".to_owned(),
                    source,
                })?;
                if text.contains("CORRUPT") {
                    return Err(MergeToolError::Exit {
                        program: "line-union".to_owned(),
                        code: Some(1),
                        stderr: format!("{}: corrupt profile", input.display()),
                    });
                }
                lines.extend(text.lines().map(str::to_owned));
            }
            let mut out = lines.into_iter().collect::<Vec<_>>().join("\n");
            out.push('\n');
            fs::write(output, out).map_err(|source| MergeToolError::Spawn {
                program: "line-union".to_owned(),
                source,
            })
        }
    }

    #[test]
    fn path_is_derived_from_ordinal() {
        assert_eq!(
            accumulator_path(Path::new("/s"), 3),
            PathBuf::from("/s/worker-03.profdata")
        );
    }

    #[test]
    fn recognizes_accumulator_file_names() {
        assert!(is_accumulator_file("worker-03.profdata"));
        assert!(is_accumulator_file("worker-12.profdata.partial"));
        assert!(!is_accumulator_file("merged.profdata"));
        assert!(!is_accumulator_file("worker-notes.txt"));
        assert!(!is_accumulator_file("coverage.tar.gz"));
    }

    #[test]
    fn first_merge_creates_then_later_merges_extend() {
        let dir = tempfile::tempdir().unwrap();
        let acc = Accumulator::new(0, accumulator_path(dir.path(), 0));
        let a = dir.path().join("a.profraw");
        let b = dir.path().join("b.profraw");
        fs::write(&a, "A\n").unwrap();
        fs::write(&b, "B\n").unwrap();

        assert!(!acc.exists());
        acc.absorb(&a, &LineUnionTool).unwrap();
        assert_eq!(fs::read_to_string(acc.path()).unwrap(), "A\n");
        acc.absorb(&b, &LineUnionTool).unwrap();
        assert_eq!(fs::read_to_string(acc.path()).unwrap(), "A\nB\n");
        assert!(!acc.partial_path().exists());
    }

    #[test]
    fn missing_raw_file_is_ingest_failure() {
        let dir = tempfile::tempdir().unwrap();
        let acc = Accumulator::new(1, accumulator_path(dir.path(), 1));
        let err = acc
            .absorb(&dir.path().join("missing.profraw"), &LineUnionTool)
            .unwrap_err();
        assert_eq!(err.stage, FailureStage::Ingest);
        assert!(!acc.exists());
    }

    #[test]
    fn directory_is_ingest_failure() {
        let dir = tempfile::tempdir().unwrap();
        let acc = Accumulator::new(1, accumulator_path(dir.path(), 1));
        let err = acc.absorb(dir.path(), &LineUnionTool).unwrap_err();
        assert_eq!(err.stage, FailureStage::Ingest);
    }

    #[test]
    fn tool_failure_leaves_accumulator_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let acc = Accumulator::new(2, accumulator_path(dir.path(), 2));
        let good = dir.path().join("good.profraw");
        let bad = dir.path().join("bad.profraw");
        fs::write(&good, "G\n").unwrap();
        fs::write(&bad, "CORRUPT\n").unwrap();

        acc.absorb(&good, &LineUnionTool).unwrap();
        let err = acc.absorb(&bad, &LineUnionTool).unwrap_err();
        assert_eq!(err.stage, FailureStage::MergeTool);
        assert!(err.reason.contains("corrupt"));
        assert_eq!(fs::read_to_string(acc.path()).unwrap(), "G\n");
        assert!(!acc.partial_path().exists());
    }
}
