//! Task queue: hands submitted jobs to workers.

pub mod libsql_queue;
pub mod memory;
pub mod traits;

use serde::Serialize;

pub use memory::MemoryQueue;
pub use traits::{QueuedTask, Revocation, TaskQueue};

use crate::error::QueueError;
use crate::tasks::TaskId;

/// Pending and scheduled ids, for introspection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub pending: Vec<TaskId>,
    pub scheduled: Vec<TaskId>,
}

impl QueueSnapshot {
    pub fn contains(&self, id: &TaskId) -> bool {
        self.pending.contains(id) || self.scheduled.contains(id)
    }
}

/// List everything still waiting to run.
pub async fn snapshot(queue: &dyn TaskQueue) -> Result<QueueSnapshot, QueueError> {
    Ok(QueueSnapshot {
        pending: queue.pending().await?,
        scheduled: queue.scheduled().await?,
    })
}
