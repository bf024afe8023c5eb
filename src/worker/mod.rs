//! Worker system: runs queued pipelines as supervised child processes.
//!
//! Core components:
//! - `state`: Run stage machine (STARTED → … → TERMINAL)
//! - `launch`: Command line construction, child spawning, run log
//! - `progress`: Progress reporting from the running pipeline
//! - `logs`: Reading run logs back
//! - `executor`: One task from parameters to terminal status
//! - `pool`: Worker loops pulling from the queue

pub mod executor;
pub mod launch;
pub mod logs;
pub mod pool;
pub mod progress;
pub mod state;

pub use executor::{Executor, RunOutcome};
pub use launch::{LaunchSpec, TASK_ID_ENV};
pub use logs::read_log;
pub use pool::spawn_worker_pool;
pub use progress::ProgressReporter;
pub use state::{ExecutionStage, RunContext};
