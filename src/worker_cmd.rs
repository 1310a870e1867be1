use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use profmerge::config::OnMergeFailure;
use profmerge::merge_tool::ExternalMergeTool;
use profmerge::worker::{Accumulator, MergeSession, SessionSettings, serve};

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Worker ordinal within the pool
    #[arg(long)]
    pub ordinal: usize,

    /// Accumulator file this worker owns
    #[arg(long)]
    pub accumulator: PathBuf,

    /// Merge tool program
    #[arg(long)]
    pub tool: String,

    /// Merge tool argument placed before `-o` (repeatable)
    #[arg(long = "tool-arg", allow_hyphen_values = true)]
    pub tool_args: Vec<String>,

    /// `skip` or `abort-worker`
    #[arg(long, default_value = "skip", value_parser = parse_policy)]
    pub on_failure: OnMergeFailure,

    /// Keep raw files after merging them
    #[arg(long)]
    pub keep_raw: bool,
}

fn parse_policy(value: &str) -> Result<OnMergeFailure, String> {
    match value {
        "skip" => Ok(OnMergeFailure::Skip),
        "abort-worker" => Ok(OnMergeFailure::AbortWorker),
        other => Err(format!("unknown failure policy '{other}' (expected skip or abort-worker)")),
    }
}

/// Serve merge requests on stdin until it closes.
pub fn run(args: WorkerArgs) -> Result<()> {
    let mut session = MergeSession::new(
        Accumulator::new(args.ordinal, args.accumulator),
        Arc::new(ExternalMergeTool::new(args.tool, args.tool_args)),
        SessionSettings {
            remove_raw: !args.keep_raw,
            on_failure: args.on_failure,
        },
    );
    serve(io::stdin().lock(), io::stdout().lock(), &mut session)
        .with_context(|| format!("merge worker {} lost its coordinator", args.ordinal))
}
