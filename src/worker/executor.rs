//! Executor: runs one queued task from parameter resolution to its terminal
//! status.
//!
//! Stages: STARTED → PARAMS_RESOLVED → OUTPUT_RESOLVED → SPAWNED → WAITING →
//! TERMINAL. Any fault jumps straight to TERMINAL as FAILED. Whatever happens,
//! the process handle is deleted and the run log closed before returning.
//!
//! The terminal write never overwrites an existing status: if an interrupt
//! already recorded REVOKED, the non-zero exit caused by its kill is dropped.
//! While an interrupt marker is present the write is held back until the
//! interrupt records its outcome or the marker lapses.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::process::Child;
use tracing::{debug, error, info, warn};

use super::launch::{LaunchSpec, RunLog, pump_output};
use super::progress::{INITIAL_MESSAGE, ProgressReporter};
use super::state::{ExecutionStage, RunContext};
use crate::config::ExecutorConfig;
use crate::error::{ExecutionError, StoreError};
use crate::interrupt::{ProcessControl, StopSignal};
use crate::queue::QueuedTask;
use crate::store::TaskRecords;
use crate::tasks::params::{self, TASK_ID_KEY};
use crate::tasks::paths::{self, LoadedConfig};
use crate::tasks::{
    Details, JobSpec, OutputLocation, ParamValue, StatusRecord, TaskId, TerminalStatus, details,
};

/// How long to wait for the output pumps to drain after the child exits.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while an in-flight interrupt settles.
const INTERRUPT_SETTLE_POLL: Duration = Duration::from_millis(100);

/// What a run ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// This run wrote the terminal status.
    Recorded(StatusRecord),
    /// A terminal status was already present and was left untouched.
    AlreadyTerminal(TerminalStatus),
}

impl RunOutcome {
    /// The status the task ends up with.
    pub fn status(&self) -> TerminalStatus {
        match self {
            Self::Recorded(record) => record.status,
            Self::AlreadyTerminal(status) => *status,
        }
    }
}

/// Runs pipelines as child processes.
pub struct Executor {
    records: TaskRecords,
    processes: Arc<dyn ProcessControl>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        records: TaskRecords,
        processes: Arc<dyn ProcessControl>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            records,
            processes,
            config,
        }
    }

    pub fn records(&self) -> &TaskRecords {
        &self.records
    }

    /// Run one task to completion.
    ///
    /// Returns an error only when the terminal status itself could not be
    /// written.
    pub async fn run(&self, task: QueuedTask) -> Result<RunOutcome, StoreError> {
        let QueuedTask { id, job } = task;
        info!(task_id = %id, target_id = %job.target, "Task started");

        let mut ctx = RunContext::new(id.clone());
        let reporter = ProgressReporter::new(self.records.clone(), id.clone());
        reporter.report(0.0, Some(INITIAL_MESSAGE)).await;
        let log = RunLog::open(&self.config.logs_dir, &id).await;

        let mut child: Option<Child> = None;
        let result = self
            .execute(&mut ctx, &job, &reporter, &log, &mut child)
            .await;

        let record = match result {
            Ok(status) => exit_record(&job, status),
            Err(e) => {
                error!(task_id = %id, stage = %ctx.stage, error = %e, "Task failed");
                let mut record = fault_record(&ctx, &job, &e);
                if let Some(child) = child.as_mut() {
                    if let Err(cleanup) = self.terminate_child(&id, child).await {
                        record
                            .details
                            .insert("cleanup".to_string(), json!(cleanup.to_string()));
                    }
                }
                record
            }
        };
        ctx.finish(record.message.clone());

        let outcome = self.finalize(&id, record).await;

        // Cleanup runs on every path, including a failed terminal write.
        if let Err(e) = self.records.clear_process_handle(&id).await {
            warn!(task_id = %id, error = %e, "Failed to delete process handle");
        }
        log.close().await;

        match &outcome {
            Ok(outcome) => info!(
                task_id = %id,
                status = %outcome.status(),
                elapsed_ms = ctx.elapsed().as_millis() as u64,
                "Task finished"
            ),
            Err(e) => error!(task_id = %id, error = %e, "Failed to record terminal status"),
        }
        outcome
    }

    async fn execute(
        &self,
        ctx: &mut RunContext,
        job: &JobSpec,
        reporter: &ProgressReporter,
        log: &RunLog,
        slot: &mut Option<Child>,
    ) -> Result<ExitStatus, ExecutionError> {
        let id = ctx.task_id.clone();

        // ── Parameters ──────────────────────────────────────────────
        let loaded: Option<LoadedConfig> = match job.config.as_deref() {
            Some(reference) => Some(paths::load_config(
                reference,
                &self.config.path_aliases,
                &self.config.workdir,
            )?),
            None => None,
        };
        let mut params = params::resolve(
            loaded.as_ref().map(|c| &c.params),
            job.parameters.as_ref(),
        )?;
        // The process-table scan correlates on this value, so it is never client-controlled.
        let own_id = ParamValue::from(id.as_str());
        if let Some(previous) = params.insert(TASK_ID_KEY.to_string(), own_id.clone()) {
            if previous != own_id {
                warn!(task_id = %id, supplied = ?previous, "Replacing client-supplied task_id");
            }
        }
        self.records.write_parameters(&id, &params).await?;
        advance(ctx, ExecutionStage::ParamsResolved);

        // ── Output location ─────────────────────────────────────────
        match paths::resolve_output_location(&params, loaded.as_ref(), &self.config.workdir) {
            OutputLocation::Resolved(dir) => {
                debug!(task_id = %id, output_dir = %dir.display(), "Output location resolved");
                self.records.write_output_location(&id, &dir).await?;
            }
            OutputLocation::Undefined => {
                debug!(task_id = %id, "No output location defined");
            }
        }
        advance(ctx, ExecutionStage::OutputResolved);

        // ── Spawn ───────────────────────────────────────────────────
        let spec = LaunchSpec::build(
            &self.config,
            &id,
            job,
            loaded.as_ref().map(|c| c.path.as_path()),
            &params,
        )?;
        info!(task_id = %id, command = %spec.display(), "Spawning pipeline");
        let child = slot.insert(spec.spawn()?);
        let pid = child.id().ok_or(ExecutionError::MissingPid)?;
        ctx.pid = Some(pid);
        self.records.write_process_handle(&id, pid).await?;
        advance(ctx, ExecutionStage::Spawned);

        let pumps = pump_output(child, log, reporter);

        // ── Wait ────────────────────────────────────────────────────
        advance(ctx, ExecutionStage::Waiting);
        let status = child.wait().await.map_err(|e| ExecutionError::Wait {
            pid,
            reason: e.to_string(),
        })?;

        if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, futures::future::join_all(pumps))
            .await
            .is_err()
        {
            warn!(task_id = %id, pid, "Output still open after exit, detaching");
        }

        debug!(task_id = %id, pid, status = %status, "Pipeline exited");
        Ok(status)
    }

    /// Write the terminal status unless one is already there.
    async fn finalize(&self, id: &TaskId, record: StatusRecord) -> Result<RunOutcome, StoreError> {
        self.await_interrupt(id).await;

        if let Some(existing) = self.records.status(id).await? {
            info!(
                task_id = %id,
                existing = %existing.status,
                discarded = %record.status,
                "Terminal status already recorded, leaving it untouched"
            );
            return Ok(RunOutcome::AlreadyTerminal(existing.status));
        }

        if self.records.write_status_if_absent(id, &record).await? {
            return Ok(RunOutcome::Recorded(record));
        }

        // Lost the race between the re-read and the write.
        let status = self
            .records
            .status(id)
            .await?
            .map(|existing| existing.status)
            .unwrap_or(record.status);
        info!(task_id = %id, existing = %status, "Terminal status written concurrently");
        Ok(RunOutcome::AlreadyTerminal(status))
    }

    /// Hold while an interrupt is signalling this task and has not yet
    /// recorded its outcome. Bounded by the marker's TTL.
    async fn await_interrupt(&self, id: &TaskId) {
        let mut announced = false;
        loop {
            match self.records.interrupt_requested(id).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Cannot read interrupt marker, not waiting");
                    return;
                }
            }
            if matches!(self.records.status(id).await, Ok(Some(_))) {
                return;
            }
            if !announced {
                info!(task_id = %id, "Interrupt in progress, waiting for its outcome");
                announced = true;
            }
            tokio::time::sleep(INTERRUPT_SETTLE_POLL).await;
        }
    }

    /// SIGTERM, then SIGKILL if the child outlives the cleanup timeout.
    async fn terminate_child(&self, id: &TaskId, child: &mut Child) -> Result<(), ExecutionError> {
        let Some(pid) = child.id() else {
            return Ok(());
        };

        warn!(task_id = %id, pid, "Terminating pipeline after fault");
        if let Err(e) = self.processes.signal(pid, StopSignal::Terminate) {
            debug!(task_id = %id, pid, error = %e, "SIGTERM failed");
        }

        let timeout = self.config.cleanup_term_timeout;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(task_id = %id, pid, "Pipeline ignored SIGTERM, killing");
                let _ = child.kill().await;
                Err(ExecutionError::CleanupTimeout { pid, timeout })
            }
        }
    }
}

fn advance(ctx: &mut RunContext, stage: ExecutionStage) {
    if let Err(e) = ctx.transition_to(stage, None) {
        warn!(task_id = %ctx.task_id, error = %e, "Unexpected stage transition");
    }
}

/// Map a child exit status to a terminal record.
fn exit_record(job: &JobSpec, status: ExitStatus) -> StatusRecord {
    if status.success() {
        return StatusRecord::new(
            TerminalStatus::Completed,
            "Pipeline completed successfully",
            details([("exit_code", json!(0)), ("target", json!(job.target))]),
        );
    }

    let mut extra = details([
        ("exit_code", json!(status.code())),
        ("target", json!(job.target)),
    ]);
    let message = match (status.code(), status.signal()) {
        (Some(code), _) => format!("Pipeline exited with code {code}"),
        (None, Some(signal)) => {
            extra.insert("signal".to_string(), json!(signal));
            format!("Pipeline terminated by signal {signal}")
        }
        (None, None) => "Pipeline exited abnormally".to_string(),
    };
    StatusRecord::failed(message, extra)
}

/// Terminal record for a fault anywhere before the child exited.
fn fault_record(ctx: &RunContext, job: &JobSpec, err: &ExecutionError) -> StatusRecord {
    let mut chain = Vec::new();
    let mut source: Option<&dyn std::error::Error> = Some(err);
    while let Some(e) = source {
        chain.push(e.to_string());
        source = e.source();
    }

    let mut extra: Details = details([
        ("error", json!(err.to_string())),
        ("error_kind", json!(error_kind(err))),
        ("stage", json!(ctx.stage)),
        ("stages", json!(ctx.path())),
        ("trace", json!(chain)),
        ("target", json!(job.target)),
    ]);
    if let Some(pid) = ctx.pid {
        extra.insert("pid".to_string(), json!(pid));
    }
    StatusRecord::failed(format!("Pipeline failed: {err}"), extra)
}

fn error_kind(err: &ExecutionError) -> &'static str {
    match err {
        ExecutionError::Resolution(_) | ExecutionError::Serialization(_) => "resolution",
        ExecutionError::Spawn(_) | ExecutionError::MissingPid => "spawn",
        ExecutionError::Wait { .. } | ExecutionError::CleanupTimeout { .. } => "execution",
        ExecutionError::Store(_) => "store",
    }
}
