//! `TaskQueue` over the `queue_tasks` table of the libSQL backend.
//!
//! Workers in other processes share the queue through the database file.
//! Dequeue is a single `UPDATE … RETURNING`, so two workers never take the
//! same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params;
use tracing::{debug, info};

use super::traits::{QueuedTask, Revocation, TaskQueue};
use crate::error::QueueError;
use crate::store::LibSqlBackend;
use crate::store::libsql_backend::now_millis;
use crate::tasks::{JobSpec, TaskId};

impl LibSqlBackend {
    async fn ids_where(&self, sql: &str, now: i64) -> Result<Vec<TaskId>, QueueError> {
        let mut rows = self
            .conn()
            .query(sql, params![now])
            .await
            .map_err(|e| QueueError::Query(e.to_string()))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| QueueError::Query(e.to_string()))?
        {
            let id: String = row
                .get(0)
                .map_err(|e| QueueError::Query(format!("row parse: {e}")))?;
            ids.push(TaskId::from(id));
        }
        Ok(ids)
    }
}

#[async_trait]
impl TaskQueue for LibSqlBackend {
    async fn enqueue(
        &self,
        job: &JobSpec,
        eta: Option<DateTime<Utc>>,
    ) -> Result<TaskId, QueueError> {
        let id = TaskId::generate();
        let payload =
            serde_json::to_string(job).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let now = now_millis();

        let result = match eta {
            Some(eta) => {
                self.conn()
                    .execute(
                        "INSERT INTO queue_tasks (id, payload, state, eta, enqueued_at, updated_at)
                         VALUES (?1, ?2, 'pending', ?3, ?4, ?4)",
                        params![id.as_str(), payload, eta.timestamp_millis(), now],
                    )
                    .await
            }
            None => {
                self.conn()
                    .execute(
                        "INSERT INTO queue_tasks (id, payload, state, enqueued_at, updated_at)
                         VALUES (?1, ?2, 'pending', ?3, ?3)",
                        params![id.as_str(), payload, now],
                    )
                    .await
            }
        };
        result.map_err(|e| QueueError::Unavailable(format!("enqueue: {e}")))?;

        debug!(task_id = %id, target_id = %job.target, "Task enqueued");
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<QueuedTask>, QueueError> {
        let now = now_millis();
        let mut rows = self
            .conn()
            .query(
                "UPDATE queue_tasks SET state = 'started', updated_at = ?1
                 WHERE seq = (
                     SELECT seq FROM queue_tasks
                     WHERE state = 'pending' AND (eta IS NULL OR eta <= ?1)
                     ORDER BY seq LIMIT 1
                 ) AND state = 'pending'
                 RETURNING id, payload",
                params![now],
            )
            .await
            .map_err(|e| QueueError::Query(format!("dequeue: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| QueueError::Query(format!("dequeue: {e}")))?
        else {
            return Ok(None);
        };

        let id: String = row
            .get(0)
            .map_err(|e| QueueError::Query(format!("dequeue row parse: {e}")))?;
        let payload: String = row
            .get(1)
            .map_err(|e| QueueError::Query(format!("dequeue row parse: {e}")))?;
        let job: JobSpec = serde_json::from_str(&payload)
            .map_err(|e| QueueError::Serialization(format!("task {id}: {e}")))?;

        Ok(Some(QueuedTask {
            id: TaskId::from(id),
            job,
        }))
    }

    async fn pending(&self) -> Result<Vec<TaskId>, QueueError> {
        self.ids_where(
            "SELECT id FROM queue_tasks
             WHERE state = 'pending' AND (eta IS NULL OR eta <= ?1) ORDER BY seq",
            now_millis(),
        )
        .await
    }

    async fn scheduled(&self) -> Result<Vec<TaskId>, QueueError> {
        self.ids_where(
            "SELECT id FROM queue_tasks WHERE state = 'pending' AND eta > ?1 ORDER BY seq",
            now_millis(),
        )
        .await
    }

    async fn revoke_once(&self, id: &TaskId) -> Result<bool, QueueError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE queue_tasks SET state = 'revoked', updated_at = ?2
                 WHERE id = ?1 AND state = 'pending'",
                params![id.as_str(), now_millis()],
            )
            .await
            .map_err(|e| QueueError::Query(format!("revoke {id}: {e}")))?;

        if changed > 0 {
            info!(task_id = %id, "Task revoked before start");
        }
        Ok(changed > 0)
    }

    async fn revocation(&self, id: &TaskId) -> Result<Revocation, QueueError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT state FROM queue_tasks WHERE id = ?1",
                params![id.as_str()],
            )
            .await
            .map_err(|e| QueueError::Query(format!("revocation {id}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let state: String = row
                    .get(0)
                    .map_err(|e| QueueError::Query(format!("revocation row parse: {e}")))?;
                Ok(if state == "revoked" {
                    Revocation::Revoked
                } else {
                    Revocation::NotRevoked
                })
            }
            Ok(None) => Ok(Revocation::Unknown),
            Err(e) => Err(QueueError::Query(format!("revocation {id}: {e}"))),
        }
    }

    async fn prune_finished(&self, before: DateTime<Utc>) -> Result<usize, QueueError> {
        let changed = self
            .conn()
            .execute(
                "DELETE FROM queue_tasks WHERE state != 'pending' AND updated_at < ?1",
                params![before.timestamp_millis()],
            )
            .await
            .map_err(|e| QueueError::Query(format!("prune: {e}")))?;
        Ok(changed as usize)
    }
}
