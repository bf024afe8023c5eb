//! Shared state: the TTL'd key/value store and the typed task records on top.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod records;
pub mod traits;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryStore;
pub use records::{ProcessHandle, TaskRecords};
pub use traits::StateStore;

use crate::config::RetentionConfig;
use crate::queue::TaskQueue;

/// Spawn a background task that periodically drops expired keys and queue
/// entries that finished longer ago than the status retention.
pub fn spawn_sweeper(
    store: Arc<dyn StateStore>,
    queue: Arc<dyn TaskQueue>,
    retention: RetentionConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(retention.sweep_interval);
        loop {
            interval.tick().await;

            match store.purge_expired().await {
                Ok(0) => {}
                Ok(n) => debug!(removed = n, "Purged expired state keys"),
                Err(e) => warn!(error = %e, "Failed to purge expired state keys"),
            }

            let cutoff = chrono::Duration::from_std(retention.status)
                .ok()
                .and_then(|ttl| Utc::now().checked_sub_signed(ttl));
            if let Some(cutoff) = cutoff {
                match queue.prune_finished(cutoff).await {
                    Ok(0) => {}
                    Ok(n) => debug!(removed = n, "Pruned finished queue entries"),
                    Err(e) => warn!(error = %e, "Failed to prune queue entries"),
                }
            }
        }
    })
}
