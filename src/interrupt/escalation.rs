//! SIGINT → poll → SIGKILL escalation against one process.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::process::{ProcessControl, StopSignal};
use crate::config::InterruptConfig;
use crate::error::SignalError;
use crate::tasks::TerminationMethod;

/// Result of trying to stop one process.
#[derive(Debug, Clone, PartialEq)]
pub enum StopResult {
    /// The process is gone.
    Stopped {
        method: TerminationMethod,
        elapsed: Duration,
        note: Option<String>,
    },
    /// Still alive after SIGKILL.
    Survived { elapsed: Duration, note: Option<String> },
    /// SIGINT found no such process; there was nothing to stop.
    NotRunning,
}

impl StopResult {
    /// The method to record, if anything was stopped (or attempted).
    pub fn method(&self) -> Option<TerminationMethod> {
        match self {
            Self::Stopped { method, .. } => Some(*method),
            Self::Survived { .. } => Some(TerminationMethod::SigkillFailed),
            Self::NotRunning => None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Stopped { elapsed, .. } | Self::Survived { elapsed, .. } => *elapsed,
            Self::NotRunning => Duration::ZERO,
        }
    }

    pub fn note(&self) -> Option<&str> {
        match self {
            Self::Stopped { note, .. } | Self::Survived { note, .. } => note.as_deref(),
            Self::NotRunning => None,
        }
    }
}

/// Ask a process to stop with SIGINT, wait out the grace period, then SIGKILL.
///
/// Signal errors never abort the attempt: a refused SIGINT goes straight to
/// SIGKILL, and a failed SIGKILL is judged by whether the process is still
/// alive afterwards.
pub async fn stop_process(
    processes: &dyn ProcessControl,
    pid: u32,
    config: &InterruptConfig,
) -> StopResult {
    let started = Instant::now();
    let mut note = None;

    match processes.signal(pid, StopSignal::Interrupt) {
        Ok(()) => {
            info!(pid, grace_ms = config.grace_period.as_millis() as u64, "SIGINT sent");
            if wait_for_exit(processes, pid, config.grace_period, config.poll_interval).await {
                return StopResult::Stopped {
                    method: TerminationMethod::Sigint,
                    elapsed: started.elapsed(),
                    note: None,
                };
            }
            warn!(pid, "Process survived the grace period, escalating to SIGKILL");
        }
        Err(SignalError::NoSuchProcess { .. }) => {
            debug!(pid, "No such process for SIGINT");
            return StopResult::NotRunning;
        }
        Err(e) => {
            warn!(pid, error = %e, "SIGINT failed, escalating to SIGKILL");
            note = Some(format!("SIGINT failed: {e}"));
        }
    }

    match processes.signal(pid, StopSignal::Kill) {
        Ok(()) => info!(pid, "SIGKILL sent"),
        Err(SignalError::NoSuchProcess { .. }) => {
            return StopResult::Stopped {
                method: TerminationMethod::Sigkill,
                elapsed: started.elapsed(),
                note: Some(join_note(note, "process exited before SIGKILL was delivered")),
            };
        }
        Err(e) => {
            warn!(pid, error = %e, "SIGKILL failed");
            note = Some(join_note(note, &format!("SIGKILL failed: {e}")));
        }
    }

    tokio::time::sleep(config.kill_wait).await;
    if processes.is_alive(pid) {
        warn!(pid, "Process still alive after SIGKILL");
        StopResult::Survived {
            elapsed: started.elapsed(),
            note,
        }
    } else {
        StopResult::Stopped {
            method: TerminationMethod::Sigkill,
            elapsed: started.elapsed(),
            note,
        }
    }
}

/// Poll liveness every `poll` until the process is gone or `grace` elapses.
async fn wait_for_exit(
    processes: &dyn ProcessControl,
    pid: u32,
    grace: Duration,
    poll: Duration,
) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        if !processes.is_alive(pid) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}

fn join_note(existing: Option<String>, addition: &str) -> String {
    match existing {
        Some(existing) => format!("{existing}; {addition}"),
        None => addition.to_string(),
    }
}
