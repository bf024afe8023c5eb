//! `TaskQueue` trait: the broker handing each task to exactly one worker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::QueueError;
use crate::tasks::{JobSpec, TaskId};

/// A task handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTask {
    pub id: TaskId,
    pub job: JobSpec,
}

/// What the queue knows about a task's revocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revocation {
    /// The task was revoked before it started.
    Revoked,
    /// The queue knows the task and it was not revoked.
    NotRevoked,
    /// The queue has never seen this id, or has forgotten it.
    Unknown,
}

/// Backend-agnostic task queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a job, optionally not before `eta`. Mints and returns the task id.
    async fn enqueue(
        &self,
        job: &JobSpec,
        eta: Option<DateTime<Utc>>,
    ) -> Result<TaskId, QueueError>;

    /// Take the oldest ready task and mark it started. Revoked tasks are never
    /// returned, and no task is returned twice.
    async fn dequeue(&self) -> Result<Option<QueuedTask>, QueueError>;

    /// Ids waiting to run now, oldest first.
    async fn pending(&self) -> Result<Vec<TaskId>, QueueError>;

    /// Ids waiting for a future `eta`, oldest first.
    async fn scheduled(&self) -> Result<Vec<TaskId>, QueueError>;

    /// Revoke a task that has not started. Returns whether it was revoked by
    /// this call; a task already started or already revoked is left alone.
    async fn revoke_once(&self, id: &TaskId) -> Result<bool, QueueError>;

    async fn revocation(&self, id: &TaskId) -> Result<Revocation, QueueError>;

    /// Forget started and revoked tasks last touched before `before`.
    async fn prune_finished(&self, before: DateTime<Utc>) -> Result<usize, QueueError>;
}
