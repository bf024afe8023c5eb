//! Typed accessors for the record kinds kept per task.
//!
//! Each kind has its own key prefix and TTL. Nothing outside this module knows
//! the key layout, so the backing store can change without touching protocol
//! logic.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::traits::StateStore;
use crate::config::RetentionConfig;
use crate::error::StoreError;
use crate::tasks::{ParamMap, ProgressRecord, StatusRecord, TaskId};

const STATUS_PREFIX: &str = "status_for_task:";
const PROGRESS_PREFIX: &str = "progress_for_task:";
const PID_PREFIX: &str = "pid_for_task:";
const PARAMETERS_PREFIX: &str = "parameters_for_task:";
const OUTPUT_DIR_PREFIX: &str = "output_dir_for_task:";
const INTERRUPT_PREFIX: &str = "interrupt_requested_for_task:";

fn key(prefix: &str, id: &TaskId) -> String {
    format!("{prefix}{id}")
}

/// The stored process handle, as read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessHandle {
    /// A usable OS process id.
    Valid(u32),
    /// Something other than a positive integer. The raw value is kept for logs.
    Malformed(String),
}

impl ProcessHandle {
    fn parse(raw: &str) -> Self {
        match raw.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Self::Valid(pid),
            _ => Self::Malformed(raw.to_string()),
        }
    }
}

/// Typed view over the shared `StateStore`.
#[derive(Clone)]
pub struct TaskRecords {
    store: Arc<dyn StateStore>,
    retention: RetentionConfig,
}

impl TaskRecords {
    pub fn new(store: Arc<dyn StateStore>, retention: RetentionConfig) -> Self {
        Self { store, retention }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    // ── Status ──────────────────────────────────────────────────────

    /// The terminal outcome, if one has been recorded.
    pub async fn status(&self, id: &TaskId) -> Result<Option<StatusRecord>, StoreError> {
        let key = key(STATUS_PREFIX, id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(task_id = %id, error = %e, "Undecodable status record, treating as absent");
                Ok(None)
            }
        }
    }

    /// Write the terminal outcome, replacing any existing one.
    pub async fn write_status(&self, id: &TaskId, record: &StatusRecord) -> Result<(), StoreError> {
        let value = encode(record)?;
        self.store
            .set(&key(STATUS_PREFIX, id), &value, self.retention.status)
            .await
    }

    /// Write the terminal outcome unless one already exists.
    pub async fn write_status_if_absent(
        &self,
        id: &TaskId,
        record: &StatusRecord,
    ) -> Result<bool, StoreError> {
        let value = encode(record)?;
        self.store
            .set_if_absent(&key(STATUS_PREFIX, id), &value, self.retention.status)
            .await
    }

    // ── Progress ────────────────────────────────────────────────────

    pub async fn progress(&self, id: &TaskId) -> Result<Option<ProgressRecord>, StoreError> {
        let key = key(PROGRESS_PREFIX, id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(task_id = %id, error = %e, "Undecodable progress record, treating as absent");
                Ok(None)
            }
        }
    }

    pub async fn write_progress(
        &self,
        id: &TaskId,
        record: &ProgressRecord,
    ) -> Result<(), StoreError> {
        let value = encode(record)?;
        self.store
            .set(&key(PROGRESS_PREFIX, id), &value, self.retention.progress)
            .await
    }

    // ── Process handle ──────────────────────────────────────────────

    pub async fn process_handle(&self, id: &TaskId) -> Result<Option<ProcessHandle>, StoreError> {
        Ok(self
            .store
            .get(&key(PID_PREFIX, id))
            .await?
            .map(|raw| ProcessHandle::parse(&raw)))
    }

    pub async fn write_process_handle(&self, id: &TaskId, pid: u32) -> Result<(), StoreError> {
        self.store
            .set(
                &key(PID_PREFIX, id),
                &pid.to_string(),
                self.retention.process_handle,
            )
            .await
    }

    /// Remove the process handle. Returns whether one was present.
    pub async fn clear_process_handle(&self, id: &TaskId) -> Result<bool, StoreError> {
        self.store.delete(&key(PID_PREFIX, id)).await
    }

    // ── Parameters ──────────────────────────────────────────────────

    /// Resolved run parameters. A record that cannot be decoded is an error.
    pub async fn parameters(&self, id: &TaskId) -> Result<Option<ParamMap>, StoreError> {
        let key = key(PARAMETERS_PREFIX, id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key,
                reason: e.to_string(),
            })
    }

    pub async fn write_parameters(&self, id: &TaskId, params: &ParamMap) -> Result<(), StoreError> {
        let value = encode(params)?;
        self.store
            .set(&key(PARAMETERS_PREFIX, id), &value, self.retention.parameters)
            .await
    }

    // ── Output location ─────────────────────────────────────────────

    pub async fn output_location(&self, id: &TaskId) -> Result<Option<String>, StoreError> {
        self.store.get(&key(OUTPUT_DIR_PREFIX, id)).await
    }

    pub async fn write_output_location(&self, id: &TaskId, dir: &Path) -> Result<(), StoreError> {
        self.store
            .set(
                &key(OUTPUT_DIR_PREFIX, id),
                &dir.to_string_lossy(),
                self.retention.output_location,
            )
            .await
    }

    // ── Interrupt marker ────────────────────────────────────────────

    /// Announce that an interrupt is about to signal this task's process.
    /// The marker lapses on its own after `ttl`.
    pub async fn mark_interrupt_requested(
        &self,
        id: &TaskId,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.store.set(&key(INTERRUPT_PREFIX, id), "1", ttl).await
    }

    pub async fn interrupt_requested(&self, id: &TaskId) -> Result<bool, StoreError> {
        self.store.exists(&key(INTERRUPT_PREFIX, id)).await
    }

    pub async fn clear_interrupt_request(&self, id: &TaskId) -> Result<bool, StoreError> {
        self.store.delete(&key(INTERRUPT_PREFIX, id)).await
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}
