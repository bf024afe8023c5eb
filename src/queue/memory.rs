//! In-memory task queue.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::traits::{QueuedTask, Revocation, TaskQueue};
use crate::error::QueueError;
use crate::tasks::{JobSpec, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Started,
    Revoked,
}

struct Entry {
    job: JobSpec,
    state: EntryState,
    eta: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl Entry {
    fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.eta.is_none_or(|eta| eta <= now)
    }
}

#[derive(Default)]
struct Inner {
    /// Pending ids in enqueue order.
    order: VecDeque<TaskId>,
    entries: HashMap<TaskId, Entry>,
}

/// Queue held in process memory. Tasks are lost on restart.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn pending_where(&self, ready: bool) -> Vec<TaskId> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter(|id| {
                inner
                    .entries
                    .get(*id)
                    .is_some_and(|e| e.state == EntryState::Pending && e.is_ready(now) == ready)
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(
        &self,
        job: &JobSpec,
        eta: Option<DateTime<Utc>>,
    ) -> Result<TaskId, QueueError> {
        let id = TaskId::generate();
        let mut inner = self.inner.lock().await;
        inner.entries.insert(
            id.clone(),
            Entry {
                job: job.clone(),
                state: EntryState::Pending,
                eta,
                updated_at: Utc::now(),
            },
        );
        inner.order.push_back(id.clone());
        debug!(task_id = %id, target_id = %job.target, "Task enqueued");
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<QueuedTask>, QueueError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let Inner { order, entries } = &mut *inner;

        let position = order.iter().position(|id| {
            entries
                .get(id)
                .is_some_and(|e| e.state == EntryState::Pending && e.is_ready(now))
        });
        let Some(position) = position else {
            return Ok(None);
        };
        let Some(id) = order.remove(position) else {
            return Ok(None);
        };
        let Some(entry) = entries.get_mut(&id) else {
            return Ok(None);
        };
        entry.state = EntryState::Started;
        entry.updated_at = now;
        Ok(Some(QueuedTask {
            id,
            job: entry.job.clone(),
        }))
    }

    async fn pending(&self) -> Result<Vec<TaskId>, QueueError> {
        Ok(self.pending_where(true).await)
    }

    async fn scheduled(&self) -> Result<Vec<TaskId>, QueueError> {
        Ok(self.pending_where(false).await)
    }

    async fn revoke_once(&self, id: &TaskId) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.get_mut(id) else {
            return Ok(false);
        };
        if entry.state != EntryState::Pending {
            return Ok(false);
        }
        entry.state = EntryState::Revoked;
        entry.updated_at = Utc::now();
        inner.order.retain(|queued| queued != id);
        info!(task_id = %id, "Task revoked before start");
        Ok(true)
    }

    async fn revocation(&self, id: &TaskId) -> Result<Revocation, QueueError> {
        let inner = self.inner.lock().await;
        Ok(match inner.entries.get(id).map(|e| e.state) {
            Some(EntryState::Revoked) => Revocation::Revoked,
            Some(_) => Revocation::NotRevoked,
            None => Revocation::Unknown,
        })
    }

    async fn prune_finished(&self, before: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().await;
        let count = inner.entries.len();
        inner
            .entries
            .retain(|_, e| e.state == EntryState::Pending || e.updated_at >= before);
        Ok(count - inner.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[tokio::test]
    async fn dequeue_is_fifo_and_single_delivery() {
        let queue = MemoryQueue::new();
        let a = queue.enqueue(&JobSpec::new("a"), None).await.unwrap();
        let b = queue.enqueue(&JobSpec::new("b"), None).await.unwrap();

        assert_eq!(queue.pending().await.unwrap(), vec![a.clone(), b.clone()]);

        let first = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.job.target, "a");
        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(second.id, b);
        assert!(queue.dequeue().await.unwrap().is_none());
        assert!(queue.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn revoke_only_affects_unstarted_tasks() {
        let queue = MemoryQueue::new();
        let started = queue.enqueue(&JobSpec::new("a"), None).await.unwrap();
        let waiting = queue.enqueue(&JobSpec::new("b"), None).await.unwrap();
        queue.dequeue().await.unwrap();

        assert!(!queue.revoke_once(&started).await.unwrap());
        assert_eq!(
            queue.revocation(&started).await.unwrap(),
            Revocation::NotRevoked
        );

        assert!(queue.revoke_once(&waiting).await.unwrap());
        assert!(!queue.revoke_once(&waiting).await.unwrap());
        assert_eq!(queue.revocation(&waiting).await.unwrap(), Revocation::Revoked);
        assert!(queue.dequeue().await.unwrap().is_none());

        assert_eq!(
            queue.revocation(&TaskId::from("nope")).await.unwrap(),
            Revocation::Unknown
        );
    }

    #[tokio::test]
    async fn scheduled_tasks_wait_for_eta() {
        let queue = MemoryQueue::new();
        let later = queue
            .enqueue(&JobSpec::new("a"), Some(Utc::now() + Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(queue.scheduled().await.unwrap(), vec![later]);
        assert!(queue.pending().await.unwrap().is_empty());
        assert!(queue.dequeue().await.unwrap().is_none());

        let past = queue
            .enqueue(&JobSpec::new("b"), Some(Utc::now() - Duration::seconds(1)))
            .await
            .unwrap();
        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, past);
    }

    #[tokio::test]
    async fn prune_keeps_pending() {
        let queue = MemoryQueue::new();
        let done = queue.enqueue(&JobSpec::new("a"), None).await.unwrap();
        let waiting = queue.enqueue(&JobSpec::new("b"), None).await.unwrap();
        queue.dequeue().await.unwrap();

        let removed = queue
            .prune_finished(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(queue.revocation(&done).await.unwrap(), Revocation::Unknown);
        assert_eq!(queue.pending().await.unwrap(), vec![waiting]);
    }
}
