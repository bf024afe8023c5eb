//! Schema migrations for the libSQL backend.
//!
//! The applied version lives in `PRAGMA user_version`; only steps above it run.

use libsql::Connection;
use tracing::{debug, info};

use crate::error::StoreError;

struct Step {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only. Versions are consecutive from 1.
const STEPS: &[Step] = &[
    Step {
        version: 1,
        name: "kv_store",
        sql: r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_kv_expires_at ON kv(expires_at);
        "#,
    },
    Step {
        version: 2,
        name: "task_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS queue_tasks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                payload TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                eta INTEGER,
                enqueued_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_tasks_state ON queue_tasks(state);
        "#,
    },
];

/// Bring the schema up to the latest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let applied = schema_version(conn).await?;

    for step in STEPS.iter().filter(|step| step.version > applied) {
        info!(version = step.version, name = step.name, "Applying schema step");
        let batch = format!("{}\nPRAGMA user_version = {};", step.sql, step.version);
        conn.execute_batch(&batch).await.map_err(|e| {
            StoreError::Migration(format!("step {} ({}) failed: {e}", step.version, step.name))
        })?;
    }

    debug!(version = schema_version(conn).await?, "Schema up to date");
    Ok(())
}

async fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("PRAGMA user_version", ())
        .await
        .map_err(|e| StoreError::Migration(format!("reading user_version: {e}")))?;
    match rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("reading user_version: {e}")))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| StoreError::Migration(format!("decoding user_version: {e}"))),
        None => Ok(0),
    }
}
