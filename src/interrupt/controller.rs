//! Interrupt controller: decides whether a task is stopped or revoked, and
//! records the outcome.
//!
//! Order of checks for a task id:
//! 1. terminal status already recorded → conflict, nothing changes
//! 2. tracked process handle → escalate against that pid
//! 3. process-table scan for the launcher signature plus the task id
//! 4. at-most-once revoke in the queue, re-checking on refusal
//!
//! Before any signal is sent an interrupt marker is written. A worker whose
//! child exits while the marker is present holds its terminal write until
//! REVOKED lands or the marker lapses, so the worker never records FAILED for
//! an exit this controller caused.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use super::escalation::{StopResult, stop_process};
use super::process::ProcessControl;
use crate::config::InterruptConfig;
use crate::error::Result;
use crate::queue::{Revocation, TaskQueue};
use crate::store::{ProcessHandle, TaskRecords};
use crate::tasks::{StatusRecord, TaskId, TaskStatus, TerminalStatus, TerminationMethod, details};

/// What an interrupt request achieved.
#[derive(Debug, Clone, PartialEq)]
pub enum InterruptOutcome {
    /// A running process was stopped (or SIGKILL was attempted).
    Interrupted {
        message: String,
        method: String,
        pid: u32,
    },
    /// The task was still queued and will never run.
    Revoked { message: String },
    /// The task is finished, or in a state an interrupt cannot act on yet.
    Conflict { status: TaskStatus, message: String },
    NotFound { message: String },
}

impl InterruptOutcome {
    pub fn message(&self) -> &str {
        match self {
            Self::Interrupted { message, .. }
            | Self::Revoked { message }
            | Self::Conflict { message, .. }
            | Self::NotFound { message } => message,
        }
    }
}

pub struct InterruptController {
    records: TaskRecords,
    queue: Arc<dyn TaskQueue>,
    processes: Arc<dyn ProcessControl>,
    config: InterruptConfig,
}

impl InterruptController {
    pub fn new(
        records: TaskRecords,
        queue: Arc<dyn TaskQueue>,
        processes: Arc<dyn ProcessControl>,
        config: InterruptConfig,
    ) -> Self {
        Self {
            records,
            queue,
            processes,
            config,
        }
    }

    /// Stop a running task or cancel a pending one.
    ///
    /// Errors are only returned when the state store or queue cannot be
    /// reached; signal failures are folded into the outcome.
    pub async fn interrupt(&self, id: &TaskId) -> Result<InterruptOutcome> {
        if let Some(record) = self.records.status(id).await? {
            info!(task_id = %id, status = %record.status, "Interrupt on finished task");
            return Ok(already_finished(record.status));
        }

        match self.records.process_handle(id).await? {
            Some(ProcessHandle::Valid(pid)) => {
                self.mark(id).await?;
                let result = stop_process(self.processes.as_ref(), pid, &self.config).await;
                if result.method().is_some() {
                    return self.record_stopped(id, vec![(pid, result)], false).await;
                }
                info!(task_id = %id, pid, "Tracked process is gone, scanning process table");
            }
            Some(ProcessHandle::Malformed(raw)) => {
                warn!(task_id = %id, raw = %raw, "Malformed process handle, deleting it");
                self.records.clear_process_handle(id).await?;
            }
            None => debug!(task_id = %id, "No process handle recorded"),
        }

        let candidates = self.discover(id).await;
        if !candidates.is_empty() {
            info!(task_id = %id, pids = ?candidates, "Found pipeline processes by scan");
            self.mark(id).await?;
            let processes = self.processes.as_ref();
            let config = &self.config;
            let results = futures::future::join_all(
                candidates
                    .iter()
                    .map(|&pid| async move { (pid, stop_process(processes, pid, config).await) }),
            )
            .await;
            let stopped: Vec<_> = results
                .into_iter()
                .filter(|(_, result)| result.method().is_some())
                .collect();
            if !stopped.is_empty() {
                return self.record_stopped(id, stopped, true).await;
            }
        }

        self.revoke_pending(id).await
    }

    async fn mark(&self, id: &TaskId) -> Result<()> {
        self.records
            .mark_interrupt_requested(id, self.config.marker_ttl())
            .await?;
        Ok(())
    }

    async fn discover(&self, id: &TaskId) -> Vec<u32> {
        let processes = Arc::clone(&self.processes);
        let signature = self.config.signature.clone();
        let task_id = id.clone();
        match tokio::task::spawn_blocking(move || processes.find_candidates(&signature, &task_id))
            .await
        {
            Ok(pids) => pids,
            Err(e) => {
                warn!(task_id = %id, error = %e, "Process table scan failed");
                Vec::new()
            }
        }
    }

    /// Record REVOKED for processes that were stopped (or that survived SIGKILL).
    async fn record_stopped(
        &self,
        id: &TaskId,
        stopped: Vec<(u32, StopResult)>,
        fallback: bool,
    ) -> Result<InterruptOutcome> {
        let method = stopped
            .iter()
            .filter_map(|(_, result)| result.method())
            .max()
            .unwrap_or(TerminationMethod::SigkillFailed);
        let elapsed = stopped
            .iter()
            .map(|(_, result)| result.elapsed())
            .max()
            .unwrap_or(Duration::ZERO);
        let pids: Vec<u32> = stopped.iter().map(|(pid, _)| *pid).collect();
        let pid = pids[0];
        let tag = if fallback {
            method.fallback_tag()
        } else {
            method.as_str().to_string()
        };

        let mut extra = details([
            ("method", json!(tag)),
            ("pid", json!(pid)),
            ("elapsed_secs", json!((elapsed.as_secs_f64() * 100.0).round() / 100.0)),
        ]);
        if fallback {
            extra.insert("pids".into(), json!(pids));
        }
        let notes: Vec<String> = stopped
            .iter()
            .filter_map(|(pid, result)| result.note().map(|note| format!("pid {pid}: {note}")))
            .collect();
        if !notes.is_empty() {
            extra.insert("note".into(), json!(notes.join("; ")));
        }

        let message = if method == TerminationMethod::SigkillFailed {
            warn!(task_id = %id, pid, method = %tag, "Process survived SIGKILL");
            format!(
                "Process {pid} is still alive after SIGKILL; manual intervention may be required"
            )
        } else {
            info!(task_id = %id, pid, method = %tag, elapsed_ms = elapsed.as_millis() as u64, "Task interrupted");
            format!(
                "Task {id} interrupted with {tag} after {:.1}s",
                elapsed.as_secs_f64()
            )
        };

        self.records
            .write_status(id, &StatusRecord::revoked(message.clone(), extra))
            .await?;
        if let Err(e) = self.records.clear_interrupt_request(id).await {
            debug!(task_id = %id, error = %e, "Interrupt marker left to expire");
        }

        Ok(InterruptOutcome::Interrupted {
            message,
            method: tag,
            pid,
        })
    }

    /// Nothing is running: try to cancel the queued task.
    async fn revoke_pending(&self, id: &TaskId) -> Result<InterruptOutcome> {
        if self.queue.revoke_once(id).await? {
            let record = StatusRecord::revoked(
                "Task revoked before it started",
                details([("reason", json!("pending")), ("method", json!("REVOKE"))]),
            );
            self.records.write_status(id, &record).await?;
            info!(task_id = %id, "Pending task revoked");
            return Ok(InterruptOutcome::Revoked {
                message: format!("Task {id} was pending and has been revoked"),
            });
        }

        // The task moved on between the checks above and the revoke.
        if let Some(record) = self.records.status(id).await? {
            return Ok(already_finished(record.status));
        }
        if let Some(ProcessHandle::Valid(pid)) = self.records.process_handle(id).await? {
            info!(task_id = %id, pid, "Task started during interrupt");
            return Ok(InterruptOutcome::Conflict {
                status: TaskStatus::Running,
                message: format!("Task {id} started running (pid {pid}) during the interrupt; retry"),
            });
        }

        match self.queue.revocation(id).await? {
            Revocation::Revoked => {
                let record = StatusRecord::revoked(
                    "Task was revoked before it started",
                    details([("reason", json!("already revoked")), ("method", json!("REVOKE"))]),
                );
                self.records.write_status(id, &record).await?;
                Ok(already_finished(TerminalStatus::Revoked))
            }
            Revocation::NotRevoked => Ok(InterruptOutcome::Conflict {
                status: TaskStatus::Running,
                message: format!(
                    "Task {id} was taken by a worker but its process is not visible yet; retry"
                ),
            }),
            Revocation::Unknown => Ok(InterruptOutcome::NotFound {
                message: format!("Task {id} not found"),
            }),
        }
    }
}

fn already_finished(status: TerminalStatus) -> InterruptOutcome {
    InterruptOutcome::Conflict {
        status: status.into(),
        message: format!("Task already finished with status {status}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionConfig;
    use crate::interrupt::StopSignal;
    use crate::interrupt::testing::{FakeProcess, FakeProcesses};
    use crate::queue::MemoryQueue;
    use crate::store::{MemoryStore, StateStore};
    use crate::tasks::JobSpec;

    struct Harness {
        records: TaskRecords,
        queue: Arc<MemoryQueue>,
        processes: Arc<FakeProcesses>,
        controller: InterruptController,
    }

    fn harness() -> Harness {
        let records = TaskRecords::new(Arc::new(MemoryStore::new()), RetentionConfig::default());
        let queue = Arc::new(MemoryQueue::new());
        let processes = Arc::new(FakeProcesses::new());
        let controller = InterruptController::new(
            records.clone(),
            queue.clone(),
            processes.clone(),
            InterruptConfig::default(),
        );
        Harness {
            records,
            queue,
            processes,
            controller,
        }
    }

    async fn running_task(h: &Harness, pid: u32, process: FakeProcess) -> TaskId {
        let id = h.queue.enqueue(&JobSpec::new("demo"), None).await.unwrap();
        h.queue.dequeue().await.unwrap();
        h.processes.add(pid, process);
        h.records.write_process_handle(&id, pid).await.unwrap();
        id
    }

    async fn stored(h: &Harness, id: &TaskId) -> StatusRecord {
        h.records.status(id).await.unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn finished_task_conflicts_and_is_untouched() {
        let h = harness();
        let id = TaskId::from("done");
        h.records
            .write_status(&id, &StatusRecord::completed("ok"))
            .await
            .unwrap();

        for _ in 0..2 {
            let outcome = h.controller.interrupt(&id).await.unwrap();
            assert!(matches!(
                outcome,
                InterruptOutcome::Conflict {
                    status: TaskStatus::Completed,
                    ..
                }
            ));
        }
        assert_eq!(stored(&h, &id).await.status, TerminalStatus::Completed);
        assert!(h.processes.signals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tracked_process_stops_on_sigint() {
        let h = harness();
        let id = running_task(&h, 4242, FakeProcess::cooperative()).await;

        let outcome = h.controller.interrupt(&id).await.unwrap();
        let InterruptOutcome::Interrupted { method, pid, message } = outcome else {
            panic!("expected interrupted, got {outcome:?}");
        };
        assert_eq!(method, "SIGINT");
        assert_eq!(pid, 4242);
        assert!(message.contains("SIGINT"));

        let record = stored(&h, &id).await;
        assert_eq!(record.status, TerminalStatus::Revoked);
        assert_eq!(record.details["method"], "SIGINT");
        assert_eq!(record.details["pid"], 4242);
        assert_eq!(h.processes.signals(), vec![(4242, StopSignal::Interrupt)]);
    }

    #[tokio::test(start_paused = true)]
    async fn marker_held_during_escalation_and_cleared_after() {
        let h = harness();
        let id = running_task(&h, 7, FakeProcess::ignores_sigint()).await;

        let during = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            h.records.interrupt_requested(&id).await.unwrap()
        };
        let (outcome, marked) = tokio::join!(h.controller.interrupt(&id), during);

        assert!(matches!(outcome.unwrap(), InterruptOutcome::Interrupted { .. }));
        assert!(marked);
        assert!(!h.records.interrupt_requested(&id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_process_is_killed() {
        let h = harness();
        let id = running_task(&h, 7, FakeProcess::ignores_sigint()).await;

        let outcome = h.controller.interrupt(&id).await.unwrap();
        assert!(matches!(
            &outcome,
            InterruptOutcome::Interrupted { method, .. } if method == "SIGKILL"
        ));
        let record = stored(&h, &id).await;
        assert_eq!(record.details["method"], "SIGKILL");
        assert!(record.details["elapsed_secs"].as_f64().unwrap() >= 8.0);
    }

    #[tokio::test(start_paused = true)]
    async fn surviving_process_asks_for_manual_intervention() {
        let h = harness();
        let id = running_task(&h, 7, FakeProcess::unkillable()).await;

        let outcome = h.controller.interrupt(&id).await.unwrap();
        assert!(outcome.message().contains("manual intervention"));
        assert_eq!(stored(&h, &id).await.details["method"], "SIGKILL_FAILED");
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_handle_is_deleted_then_scan_finds_process() {
        let h = harness();
        let id = h.queue.enqueue(&JobSpec::new("demo"), None).await.unwrap();
        h.queue.dequeue().await.unwrap();
        h.records
            .store()
            .set(&format!("pid_for_task:{id}"), "not-a-pid", Duration::from_secs(60))
            .await
            .unwrap();
        h.processes.add_discoverable(31, FakeProcess::cooperative());

        let outcome = h.controller.interrupt(&id).await.unwrap();
        assert!(matches!(
            &outcome,
            InterruptOutcome::Interrupted { method, pid: 31, .. } if method == "SIGINT_FALLBACK"
        ));
        assert!(h.records.process_handle(&id).await.unwrap().is_none());

        let record = stored(&h, &id).await;
        assert_eq!(record.details["method"], "SIGINT_FALLBACK");
        assert_eq!(record.details["pids"], json!([31]));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_handle_falls_back_to_all_candidates() {
        let h = harness();
        let id = h.queue.enqueue(&JobSpec::new("demo"), None).await.unwrap();
        h.queue.dequeue().await.unwrap();
        // Handle points at a pid that no longer exists.
        h.records.write_process_handle(&id, 999).await.unwrap();
        h.processes.add_discoverable(40, FakeProcess::cooperative());
        h.processes.add_discoverable(41, FakeProcess::ignores_sigint());

        let outcome = h.controller.interrupt(&id).await.unwrap();
        assert!(matches!(
            &outcome,
            InterruptOutcome::Interrupted { method, pid: 40, .. } if method == "SIGKILL_FALLBACK"
        ));
        let record = stored(&h, &id).await;
        assert_eq!(record.details["pids"], json!([40, 41]));
        assert!(h.processes.signals().contains(&(999, StopSignal::Interrupt)));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_task_is_revoked() {
        let h = harness();
        let id = h.queue.enqueue(&JobSpec::new("demo"), None).await.unwrap();

        let outcome = h.controller.interrupt(&id).await.unwrap();
        assert!(matches!(outcome, InterruptOutcome::Revoked { .. }));
        let record = stored(&h, &id).await;
        assert_eq!(record.status, TerminalStatus::Revoked);
        assert_eq!(record.details["reason"], "pending");
        assert!(h.queue.dequeue().await.unwrap().is_none());

        // A second call sees the recorded outcome.
        let again = h.controller.interrupt(&id).await.unwrap();
        assert!(matches!(
            again,
            InterruptOutcome::Conflict {
                status: TaskStatus::Revoked,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_task_is_not_found() {
        let h = harness();
        let outcome = h.controller.interrupt(&TaskId::from("never")).await.unwrap();
        assert!(matches!(outcome, InterruptOutcome::NotFound { .. }));
        assert!(h.records.status(&TaskId::from("never")).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn started_task_without_handle_conflicts_as_running() {
        let h = harness();
        let id = h.queue.enqueue(&JobSpec::new("demo"), None).await.unwrap();
        h.queue.dequeue().await.unwrap();

        let outcome = h.controller.interrupt(&id).await.unwrap();
        assert!(matches!(
            outcome,
            InterruptOutcome::Conflict {
                status: TaskStatus::Running,
                ..
            }
        ));
        assert!(h.records.status(&id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn revoked_in_queue_without_record_is_reconciled() {
        let h = harness();
        let id = h.queue.enqueue(&JobSpec::new("demo"), None).await.unwrap();
        assert!(h.queue.revoke_once(&id).await.unwrap());

        let outcome = h.controller.interrupt(&id).await.unwrap();
        assert!(matches!(
            outcome,
            InterruptOutcome::Conflict {
                status: TaskStatus::Revoked,
                ..
            }
        ));
        assert_eq!(stored(&h, &id).await.status, TerminalStatus::Revoked);
    }

    #[tokio::test]
    async fn real_process_ignoring_sigint_is_killed() {
        use crate::interrupt::OsProcesses;

        let records = TaskRecords::new(Arc::new(MemoryStore::new()), RetentionConfig::default());
        let controller = InterruptController::new(
            records.clone(),
            Arc::new(MemoryQueue::new()),
            Arc::new(OsProcesses::new()),
            InterruptConfig {
                grace_period: Duration::from_millis(400),
                poll_interval: Duration::from_millis(50),
                kill_wait: Duration::from_millis(300),
                signature: "no-such-launcher-signature".into(),
            },
        );

        let mut child = std::process::Command::new("sh")
            .arg("-c")
            .arg("trap '' INT; exec sleep 30")
            .spawn()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let id = TaskId::generate();
        records.write_process_handle(&id, child.id()).await.unwrap();

        let outcome = controller.interrupt(&id).await.unwrap();
        let _ = child.wait();
        assert!(matches!(
            &outcome,
            InterruptOutcome::Interrupted { method, .. } if method == "SIGKILL"
        ));
        assert_eq!(
            records.status(&id).await.unwrap().unwrap().status,
            TerminalStatus::Revoked
        );
    }
}
