//! Status resolution: reconstructs a task's current state from the records
//! and the queue.
//!
//! Precedence, first match wins:
//! 1. terminal status record (progress reported as 1.0)
//! 2. progress record → RUNNING
//! 3. listed as pending or scheduled in the queue → PENDING
//! 4. revoked in the queue → REVOKED, unless a status record appeared meanwhile
//! 5. taken by a worker that has not reported yet → RUNNING at 0.0
//! 6. otherwise unknown

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::queue::{self, Revocation, TaskQueue};
use crate::store::TaskRecords;
use crate::tasks::{StatusRecord, TaskId, TaskStatus, TaskStatusReport};
use crate::worker::progress::clamp_progress;

pub struct StatusResolver {
    records: TaskRecords,
    queue: Arc<dyn TaskQueue>,
}

impl StatusResolver {
    pub fn new(records: TaskRecords, queue: Arc<dyn TaskQueue>) -> Self {
        Self { records, queue }
    }

    /// Current state of a task, or `None` if nothing is known about it.
    pub async fn resolve(&self, id: &TaskId) -> Result<Option<TaskStatusReport>> {
        if let Some(record) = self.records.status(id).await? {
            return Ok(Some(terminal_report(id, record)));
        }

        if let Some(progress) = self.records.progress(id).await? {
            // A status may have landed between the two reads.
            if let Some(record) = self.records.status(id).await? {
                return Ok(Some(terminal_report(id, record)));
            }
            return Ok(Some(TaskStatusReport {
                task_id: id.clone(),
                status: TaskStatus::Running,
                message: Some(progress.message),
                progress: Some(clamp_progress(progress.progress)),
                details: None,
            }));
        }

        let snapshot = queue::snapshot(self.queue.as_ref()).await?;
        if snapshot.contains(id) {
            return Ok(Some(TaskStatusReport {
                task_id: id.clone(),
                status: TaskStatus::Pending,
                message: Some("Task is waiting in the queue".to_string()),
                progress: Some(0.0),
                details: None,
            }));
        }

        match self.queue.revocation(id).await? {
            Revocation::Revoked => {
                if let Some(record) = self.records.status(id).await? {
                    return Ok(Some(terminal_report(id, record)));
                }
                Ok(Some(TaskStatusReport {
                    task_id: id.clone(),
                    status: TaskStatus::Revoked,
                    message: Some("Task was revoked before it started".to_string()),
                    progress: Some(0.0),
                    details: None,
                }))
            }
            Revocation::NotRevoked => {
                // Dequeued, but the first progress write has not landed yet.
                if let Some(record) = self.records.status(id).await? {
                    return Ok(Some(terminal_report(id, record)));
                }
                let (progress, message) = match self.records.progress(id).await? {
                    Some(p) => (clamp_progress(p.progress), p.message),
                    None => (0.0, "Task picked up by a worker".to_string()),
                };
                Ok(Some(TaskStatusReport {
                    task_id: id.clone(),
                    status: TaskStatus::Running,
                    message: Some(message),
                    progress: Some(progress),
                    details: None,
                }))
            }
            Revocation::Unknown => {
                debug!(task_id = %id, "Task unknown");
                Ok(None)
            }
        }
    }
}

fn terminal_report(id: &TaskId, record: StatusRecord) -> TaskStatusReport {
    TaskStatusReport {
        task_id: id.clone(),
        status: record.status.into(),
        message: Some(record.message),
        progress: Some(1.0),
        details: Some(record.details),
    }
}
