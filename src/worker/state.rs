//! Execution state machine for a single worker run.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tasks::TaskId;

/// Stage of a worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStage {
    /// Task received from the queue.
    Started,
    /// Parameters merged and recorded.
    ParamsResolved,
    /// Output location determined.
    OutputResolved,
    /// Child process running, handle recorded.
    Spawned,
    /// Blocked on child exit.
    Waiting,
    /// Outcome decided.
    Terminal,
}

impl ExecutionStage {
    /// Stages only move forward, and any stage may jump to `Terminal`.
    pub fn can_transition_to(&self, target: ExecutionStage) -> bool {
        use ExecutionStage::*;

        matches!(
            (self, target),
            (Started, ParamsResolved)
                | (ParamsResolved, OutputResolved)
                | (OutputResolved, Spawned)
                | (Spawned, Waiting)
                | (Started | ParamsResolved | OutputResolved | Spawned | Waiting, Terminal)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal)
    }
}

impl std::fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Started => "STARTED",
            Self::ParamsResolved => "PARAMS_RESOLVED",
            Self::OutputResolved => "OUTPUT_RESOLVED",
            Self::Spawned => "SPAWNED",
            Self::Waiting => "WAITING",
            Self::Terminal => "TERMINAL",
        };
        write!(f, "{s}")
    }
}

/// A stage transition event.
#[derive(Debug, Clone, Serialize)]
pub struct StageTransition {
    pub from: ExecutionStage,
    pub to: ExecutionStage,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Bookkeeping for one run: current stage, child pid, transition history.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub task_id: TaskId,
    pub stage: ExecutionStage,
    /// Child pid once spawned.
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StageTransition>,
}

impl RunContext {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            stage: ExecutionStage::Started,
            pid: None,
            started_at: Utc::now(),
            finished_at: None,
            transitions: Vec::new(),
        }
    }

    /// Move to a new stage.
    pub fn transition_to(
        &mut self,
        stage: ExecutionStage,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.stage.can_transition_to(stage) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.stage, stage
            ));
        }

        tracing::debug!(task_id = %self.task_id, from = %self.stage, to = %stage, "Run stage");
        self.transitions.push(StageTransition {
            from: self.stage,
            to: stage,
            timestamp: Utc::now(),
            reason,
        });
        self.stage = stage;

        if stage.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Jump to `Terminal` from wherever the run is. No-op if already there.
    pub fn finish(&mut self, reason: impl Into<String>) {
        if !self.stage.is_terminal() {
            let _ = self.transition_to(ExecutionStage::Terminal, Some(reason.into()));
        }
    }

    /// Time since the run started (until it finished, if it has).
    pub fn elapsed(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        end.signed_duration_since(self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Stage names visited so far, in order, starting with `STARTED`.
    pub fn path(&self) -> Vec<ExecutionStage> {
        std::iter::once(ExecutionStage::Started)
            .chain(self.transitions.iter().map(|t| t.to))
            .collect()
    }
}
