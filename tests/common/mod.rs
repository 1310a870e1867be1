//! Shared test helpers for profmerge integration tests.
//!
//! All tests use temp directories and loopback sockets on OS-assigned ports.
//! Merging is done by a line-union stand-in for `llvm-profdata`: each "raw
//! file" is a set of lines, and merging is the sorted union, which is
//! associative and commutative like the real thing. Inputs containing
//! `CORRUPT` make the merge fail.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use profmerge::config::{Isolation, ProfmergeConfig};
use profmerge::merge_tool::{MergeTool, MergeToolError};

/// In-process merge tool: sorted line union, fails on `CORRUPT`.
pub struct LineUnionTool;

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
                    stderr: "corrupt profile".to_owned(),
                });
            }
            lines.extend(text.lines().map(str::to_owned));
        }
        fs::write(output, render(&lines)).map_err(|source| MergeToolError::Spawn {
            program: "line-union".to_owned(),
            source,
        })
    }
}

fn render(lines: &BTreeSet<String>) -> String {
    lines.iter().map(|l| format!("{l}\n")).collect()
}

/// Write a raw file whose content is `lines`, one per line.
pub fn write_raw(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
    let path = dir.join(name);
    let body: String = lines.iter().map(|l| format!("{l}\n")).collect();
    fs::write(&path, body).expect("failed to write raw file");
    path
}

/// Lines of a merged file as a set.
pub fn lines_of(path: &Path) -> BTreeSet<String> {
    fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()))
        .lines()
        .map(str::to_owned)
        .collect()
}

/// Owned set from string literals.
pub fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

/// Config rooted at `root`: output in `<root>/out`, lock in `<root>`,
/// thread isolation, and an OS-assigned control port.
pub fn thread_config(root: &Path, workers: usize) -> ProfmergeConfig {
    let mut config = ProfmergeConfig::default();
    config.coordinator.output_dir = root.join("out");
    config.coordinator.lock_file = root.join("profmerge.pid");
    config.coordinator.workers = workers;
    config.coordinator.isolation = Isolation::Thread;
    config.control.address = "127.0.0.1:0".to_owned();
    config.control.connect_retries = 50;
    config
}

/// A loopback address nothing is listening on right now.
pub fn free_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind probe socket");
    listener
        .local_addr()
        .expect("probe socket has no address")
        .to_string()
}

/// Write an executable shell script that behaves like `llvm-profdata merge`
/// over line-union files: `<script> merge -o OUT IN...`.
///
/// Fails on inputs containing `CORRUPT`; kills its parent (the merge
/// worker) on inputs containing `CRASH`.
#[cfg(unix)]
pub fn fake_merge_tool(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt as _;

    let script = dir.join("fake-profdata");
    fs::write(
        &script,
        r#"#!/bin/sh
out=
files=
while [ "$#" -gt 0 ]; do
  case "$1" in
    merge) ;;
    -o) out="$2"; shift ;;
    *) files="$files $1" ;;
  esac
  shift
done
if cat $files | grep -q CRASH; then kill -9 $PPID; exit 1; fi
if cat $files | grep -q CORRUPT; then echo "corrupt profile" >&2; exit 1; fi
cat $files | LC_ALL=C sort -u > "$out"
"#,
    )
    .expect("failed to write fake merge tool");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755))
        .expect("failed to chmod fake merge tool");
    script
}

/// Write `profmerge.toml` into `dir` for CLI tests.
pub fn write_cli_config(dir: &Path, address: &str, tool: &Path, workers: usize) -> PathBuf {
    let config = format!(
        r#"[coordinator]
output_dir = "{out}"
lock_file = "{lock}"
workers = {workers}

[control]
address = "{address}"
connect_retries = 50

[merge]
tool = "{tool}"
"#,
        out = dir.join("out").display(),
        lock = dir.join("profmerge.pid").display(),
        tool = tool.display(),
    );
    let path = dir.join("profmerge.toml");
    fs::write(&path, config).expect("failed to write config");
    path
}

/// Run profmerge with the given args in the given directory.
pub fn profmerge_in(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_profmerge"))
        .args(args)
        .current_dir(dir)
        .env_remove("PROFMERGE_CONFIG")
        .output()
        .expect("failed to execute profmerge")
}

/// Run profmerge and assert it succeeds. Returns stdout as string.
pub fn profmerge_ok(dir: &Path, args: &[&str]) -> String {
    let out = profmerge_in(dir, args);
    let stderr = String::from_utf8_lossy(&out.stderr);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(
        out.status.success(),
        "profmerge {} failed:\nstdout: {stdout}\nstderr: {stderr}",
        args.join(" "),
    );
    stdout.to_string()
}

/// Path of the profmerge binary under test.
pub fn profmerge_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_profmerge"))
}
