//! OS process control: signals, liveness checks and process-table scans.
//!
//! `ProcessControl` is the seam between the interrupt protocol and the OS.
//! `OsProcesses` is the real implementation; tests substitute fakes.

use std::ffi::OsString;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tracing::debug;

use crate::error::SignalError;
use crate::tasks::TaskId;
use crate::tasks::params::TASK_ID_KEY;
use crate::worker::launch::OVERRIDE_JSON_FLAG;

/// Signals used to stop a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGINT, the graceful request.
    Interrupt,
    /// SIGTERM, used by the worker when tearing down after a fault.
    Terminate,
    /// SIGKILL.
    Kill,
}

impl StopSignal {
    fn as_nix(self) -> Signal {
        match self {
            Self::Interrupt => Signal::SIGINT,
            Self::Terminate => Signal::SIGTERM,
            Self::Kill => Signal::SIGKILL,
        }
    }
}

impl std::fmt::Display for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Kill => "SIGKILL",
        };
        write!(f, "{s}")
    }
}

pub trait ProcessControl: Send + Sync {
    /// Send a signal to a process.
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<(), SignalError>;

    /// Whether the process exists and is not a zombie.
    fn is_alive(&self, pid: u32) -> bool;

    /// Pids of live processes whose command line contains `signature` and whose
    /// override JSON names this task, excluding the calling process. Ascending
    /// order.
    fn find_candidates(&self, signature: &str, task_id: &TaskId) -> Vec<u32>;
}

/// `ProcessControl` backed by `kill(2)` and the OS process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcesses;

impl OsProcesses {
    pub fn new() -> Self {
        Self
    }
}

fn to_pid(pid: u32) -> Result<Pid, SignalError> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => Err(SignalError::Other {
            pid,
            reason: "not a valid process id".to_string(),
        }),
    }
}

fn is_zombie(pid: u32) -> bool {
    let target = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system
        .process(target)
        .is_some_and(|p| p.status() == ProcessStatus::Zombie)
}

/// Whether a command line belongs to `task_id`: some argument mentions the
/// launcher signature, and the override JSON's top-level `task_id` is exactly
/// that id.
fn correlates(cmd: &[OsString], signature: &str, task_id: &TaskId) -> bool {
    let args: Vec<_> = cmd.iter().map(|part| part.to_string_lossy()).collect();
    if !args.iter().any(|arg| arg.contains(signature)) {
        return false;
    }
    args.windows(2).any(|pair| {
        pair[0] == OVERRIDE_JSON_FLAG
            && override_task_id(&pair[1]).as_deref() == Some(task_id.as_str())
    })
}

fn override_task_id(json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    value.get(TASK_ID_KEY)?.as_str().map(str::to_string)
}

impl ProcessControl for OsProcesses {
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<(), SignalError> {
        let target = to_pid(pid)?;
        kill(target, signal.as_nix()).map_err(|errno| match errno {
            Errno::ESRCH => SignalError::NoSuchProcess { pid },
            Errno::EPERM => SignalError::PermissionDenied { pid },
            other => SignalError::Other {
                pid,
                reason: other.desc().to_string(),
            },
        })?;
        debug!(pid, signal = %signal, "Signal sent");
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(target) = to_pid(pid) else {
            return false;
        };
        match kill(target, None::<Signal>) {
            Ok(()) => !is_zombie(pid),
            // Exists, but owned by someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn find_candidates(&self, signature: &str, task_id: &TaskId) -> Vec<u32> {
        if signature.is_empty() {
            return Vec::new();
        }

        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        let own_pid = sysinfo::get_current_pid().ok();

        let mut pids: Vec<u32> = system
            .processes()
            .iter()
            .filter(|(pid, _)| Some(**pid) != own_pid)
            .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
            .filter(|(_, process)| correlates(process.cmd(), signature, task_id))
            .map(|(pid, _)| pid.as_u32())
            .collect();
        pids.sort_unstable();

        debug!(task_id = %task_id, signature, found = pids.len(), "Process table scanned");
        pids
    }
}
