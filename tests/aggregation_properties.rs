//! Property tests: the final artifact does not depend on how raw files are
//! spread across workers or the order they arrive in.
//!
//! Coverage:
//! - random file sets pushed through a real thread-isolated pool of 1..5 slots
//! - random explicit partitions folded through per-worker accumulators
//! - every ingested file is merged exactly once

#![allow(clippy::all, clippy::pedantic, clippy::nursery, clippy::unwrap_used)]

mod common;

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use proptest::prelude::*;

use profmerge::aggregate::FinalAggregator;
use profmerge::config::OnMergeFailure;
use profmerge::listener::ControlHandler;
use profmerge::queue::{IngestQueue, RawFileRef};
use profmerge::worker::{
    Accumulator, InlineLauncher, SessionSettings, WorkerPool, accumulator_path,
};

use common::{LineUnionTool, lines_of};

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Raw file contents: each file is a small non-empty set of counter lines.
fn raw_contents() -> impl Strategy<Value = Vec<BTreeSet<String>>> {
    prop::collection::vec(prop::collection::btree_set("[a-e][0-3]", 1..4), 1..12)
}

/// Contents plus an arrival order (a permutation of file indices).
fn contents_and_order() -> impl Strategy<Value = (Vec<BTreeSet<String>>, Vec<usize>)> {
    raw_contents().prop_flat_map(|files| {
        let order: Vec<usize> = (0..files.len()).collect();
        (Just(files), Just(order).prop_shuffle())
    })
}

/// Contents plus a worker assignment for every file.
fn contents_and_partition() -> impl Strategy<Value = (Vec<BTreeSet<String>>, usize, Vec<usize>)> {
    (raw_contents(), 1usize..5).prop_flat_map(|(files, workers)| {
        let n = files.len();
        (
            Just(files),
            Just(workers),
            prop::collection::vec(0..workers, n),
        )
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn write_files(dir: &Path, files: &[BTreeSet<String>]) -> Vec<PathBuf> {
    files
        .iter()
        .enumerate()
        .map(|(i, lines)| {
            let path = dir.join(format!("t{i}.profraw"));
            let body: String = lines.iter().map(|l| format!("{l}\n")).collect();
            fs::write(&path, body).unwrap();
            path
        })
        .collect()
}

fn expected_union(files: &[BTreeSet<String>]) -> BTreeSet<String> {
    files.iter().flatten().cloned().collect()
}

fn settings() -> SessionSettings {
    SessionSettings {
        remove_raw: true,
        on_failure: OnMergeFailure::Skip,
    }
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn pool_result_is_the_union_regardless_of_arrival_order(
        (files, order) in contents_and_order(),
        workers in 1usize..5,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        let raws = write_files(dir.path(), &files);

        let launcher = Arc::new(InlineLauncher::new(
            scratch.clone(),
            Arc::new(LineUnionTool),
            settings(),
        ));
        let mut pool = WorkerPool::start(workers, launcher, IngestQueue::new(), 0).unwrap();
        for &i in &order {
            pool.on_ingest(RawFileRef::new(&raws[i])).unwrap();
        }
        let reports = pool.drain().unwrap();

        prop_assert_eq!(reports.iter().map(|r| r.merged).sum::<usize>(), files.len());
        prop_assert!(pool.queue().is_empty());

        let candidates: Vec<PathBuf> =
            (0..workers).map(|o| accumulator_path(&scratch, o)).collect();
        let output = dir.path().join("merged.profdata");
        let tool = LineUnionTool;
        FinalAggregator::new(&tool, output.clone()).aggregate(&candidates).unwrap();

        prop_assert_eq!(lines_of(&output), expected_union(&files));
        prop_assert!(raws.iter().all(|r| !r.exists()));
    }

    #[test]
    fn any_partition_yields_identical_bytes((files, workers, assignment) in contents_and_partition()) {
        let dir = tempfile::tempdir().unwrap();
        let tool = LineUnionTool;

        // Reference: everything through a single accumulator, in order.
        let reference_dir = dir.path().join("reference");
        fs::create_dir_all(&reference_dir).unwrap();
        let reference_raws = write_files(&reference_dir, &files);
        let single = Accumulator::new(0, reference_dir.join("acc.profdata"));
        for raw in &reference_raws {
            single.absorb(raw, &tool).unwrap();
        }
        let reference_out = reference_dir.join("merged.profdata");
        FinalAggregator::new(&tool, reference_out.clone())
            .aggregate(&[single.path().to_path_buf()])
            .unwrap();

        // Partitioned: file i goes to worker assignment[i], processed in
        // reverse arrival order.
        let split_dir = dir.path().join("split");
        fs::create_dir_all(&split_dir).unwrap();
        let split_raws = write_files(&split_dir, &files);
        let accumulators: Vec<Accumulator> = (0..workers)
            .map(|o| Accumulator::new(o, accumulator_path(&split_dir, o)))
            .collect();
        for (i, raw) in split_raws.iter().enumerate().rev() {
            accumulators[assignment[i]]
                .absorb(raw, &tool)
                .unwrap();
        }
        let split_out = split_dir.join("merged.profdata");
        let candidates: Vec<PathBuf> =
            accumulators.iter().map(|a| a.path().to_path_buf()).collect();
        FinalAggregator::new(&tool, split_out.clone())
            .aggregate(&candidates)
            .unwrap();

        prop_assert_eq!(
            fs::read(&reference_out).unwrap(),
            fs::read(&split_out).unwrap()
        );
    }
}
