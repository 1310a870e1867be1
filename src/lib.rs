//! profmerge library crate: the merge coordinator behind the `profmerge` binary.
//!
//! The binary is a thin CLI over these modules; they are public so that
//! integration tests can run a coordinator in-process, substitute the merge
//! tool, and drive the control protocol directly.

pub mod aggregate;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod listener;
pub mod lock;
pub mod merge_tool;
pub mod protocol;
pub mod queue;
pub mod report;
pub mod signals;
pub mod telemetry;
pub mod worker;

pub use config::ProfmergeConfig;
pub use coordinator::{Coordinator, CoordinatorPhase, RunSummary, RunningCoordinator};
pub use error::CoordinatorError;
