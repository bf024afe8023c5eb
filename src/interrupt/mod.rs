//! Interrupt system: stops running tasks and revokes pending ones.
//!
//! - `process`: `ProcessControl` seam over signals and the process table
//! - `escalation`: SIGINT, grace period, SIGKILL against one pid
//! - `controller`: the full interrupt protocol for a task id

pub mod controller;
pub mod escalation;
pub mod process;

pub use controller::{InterruptController, InterruptOutcome};
pub use escalation::{StopResult, stop_process};
pub use process::{OsProcesses, ProcessControl, StopSignal};
