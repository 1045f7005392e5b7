//! CLI-specific functionality for the `taskgroup` binary
//!
//! Argument parsing and the simulated transfers the binary schedules.

pub mod args;
pub mod simulation;

pub use args::{Args, Commands, ExecutionMode, RunConfig};
pub use simulation::{RunSummary, SimulatedTransfer, TaskSummary, run_simulation};
