//! Submitter: turns a job description into a queued task id.
//!
//! Only structural checks happen here. Whether the target or config actually
//! exists is decided by the worker when the task runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::error::SubmitError;
use crate::queue::TaskQueue;
use crate::tasks::{JobSpec, TaskId};

pub struct Submitter {
    queue: Arc<dyn TaskQueue>,
}

impl Submitter {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self { queue }
    }

    /// Enqueue a job for immediate execution.
    pub async fn submit(&self, job: JobSpec) -> Result<TaskId, SubmitError> {
        self.enqueue(job, None).await
    }

    /// Enqueue a job that no worker picks up before `eta`.
    pub async fn schedule(&self, job: JobSpec, eta: DateTime<Utc>) -> Result<TaskId, SubmitError> {
        self.enqueue(job, Some(eta)).await
    }

    async fn enqueue(
        &self,
        job: JobSpec,
        eta: Option<DateTime<Utc>>,
    ) -> Result<TaskId, SubmitError> {
        validate(&job)?;

        let id = self.queue.enqueue(&job, eta).await.map_err(|e| {
            error!(target_id = %job.target, error = %e, "Failed to enqueue job");
            SubmitError::from(e)
        })?;

        info!(
            task_id = %id,
            target_id = %job.target,
            config = job.config.as_deref().unwrap_or("-"),
            scheduled = eta.is_some(),
            "Job submitted"
        );
        Ok(id)
    }
}

fn validate(job: &JobSpec) -> Result<(), SubmitError> {
    if job.target.trim().is_empty() {
        return Err(SubmitError::InvalidJob("target must not be empty".into()));
    }
    if job.config.as_deref().is_some_and(|c| c.trim().is_empty()) {
        return Err(SubmitError::InvalidJob(
            "config must not be empty when given".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::QueueError;
    use crate::queue::{MemoryQueue, QueuedTask, Revocation};

    struct BrokenQueue;

    #[async_trait]
    impl TaskQueue for BrokenQueue {
        async fn enqueue(
            &self,
            _job: &JobSpec,
            _eta: Option<DateTime<Utc>>,
        ) -> Result<TaskId, QueueError> {
            Err(QueueError::Unavailable("connection refused".into()))
        }
        async fn dequeue(&self) -> Result<Option<QueuedTask>, QueueError> {
            Ok(None)
        }
        async fn pending(&self) -> Result<Vec<TaskId>, QueueError> {
            Ok(vec![])
        }
        async fn scheduled(&self) -> Result<Vec<TaskId>, QueueError> {
            Ok(vec![])
        }
        async fn revoke_once(&self, _id: &TaskId) -> Result<bool, QueueError> {
            Ok(false)
        }
        async fn revocation(&self, _id: &TaskId) -> Result<Revocation, QueueError> {
            Ok(Revocation::Unknown)
        }
        async fn prune_finished(&self, _before: DateTime<Utc>) -> Result<usize, QueueError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn submit_returns_queued_id() {
        let queue = Arc::new(MemoryQueue::new());
        let submitter = Submitter::new(queue.clone());

        let id = submitter.submit(JobSpec::new("demo")).await.unwrap();
        assert!(!id.as_str().is_empty());
        assert_eq!(queue.pending().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn schedule_lands_in_scheduled_list() {
        let queue = Arc::new(MemoryQueue::new());
        let submitter = Submitter::new(queue.clone());

        let eta = Utc::now() + chrono::Duration::minutes(10);
        let id = submitter.schedule(JobSpec::new("demo"), eta).await.unwrap();
        assert_eq!(queue.scheduled().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn empty_target_is_rejected() {
        let submitter = Submitter::new(Arc::new(MemoryQueue::new()));
        let err = submitter.submit(JobSpec::new("  ")).await.unwrap_err();
        assert!(matches!(err, SubmitError::InvalidJob(_)));
    }

    #[tokio::test]
    async fn broker_failure_surfaces_without_id() {
        let submitter = Submitter::new(Arc::new(BrokenQueue));
        let err = submitter.submit(JobSpec::new("demo")).await.unwrap_err();
        assert!(matches!(err, SubmitError::Queue(QueueError::Unavailable(_))));
    }
}
