//! libSQL backend: `StateStore` (and `TaskQueue`, see `queue::libsql_queue`)
//! over a single database file.
//!
//! Several processes can open the same file, which is how a separate worker
//! process and the API process share task state.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{info, warn};

use super::migrations;
use super::traits::StateStore;
use crate::error::StoreError;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "State database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        // Readers and writers in other processes wait instead of failing fast.
        if let Err(e) = self.conn.query("PRAGMA busy_timeout = 5000", ()).await {
            warn!(error = %e, "Failed to set busy_timeout, continuing without it");
        }
        migrations::run_migrations(&self.conn).await
    }

    /// Get the connection.
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Milliseconds since the epoch, the unit of every stored timestamp.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Duration) -> i64 {
    now_millis().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

#[async_trait]
impl StateStore for LibSqlBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT value FROM kv WHERE key = ?1 AND expires_at > ?2",
                params![key, now_millis()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get {key}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("get {key} row parse: {e}")))?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get {key}: {e}"))),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expiry_millis(ttl)],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set {key}: {e}")))?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        // An expired row counts as absent and is replaced in the same statement.
        let changed = self
            .conn()
            .execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
                 WHERE kv.expires_at <= ?4",
                params![key, value, expiry_millis(ttl), now_millis()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_if_absent {key}: {e}")))?;
        Ok(changed > 0)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let changed = self
            .conn()
            .execute(
                "DELETE FROM kv WHERE key = ?1 AND expires_at > ?2",
                params![key, now_millis()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete {key}: {e}")))?;
        Ok(changed > 0)
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let changed = self
            .conn()
            .execute("DELETE FROM kv WHERE expires_at <= ?1", params![now_millis()])
            .await
            .map_err(|e| StoreError::Query(format!("purge_expired: {e}")))?;
        Ok(changed as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn busy_timeout_is_applied() {
        let db = test_db().await;
        let mut rows = db.conn().query("PRAGMA busy_timeout", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 5000);
    }

    #[tokio::test]
    async fn set_get_roundtrip() {
        let db = test_db().await;
        db.set("status_for_task:a", "{}", HOUR).await.unwrap();
        assert_eq!(
            db.get("status_for_task:a").await.unwrap().as_deref(),
            Some("{}")
        );
        assert!(db.get("status_for_task:b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_overwrites() {
        let db = test_db().await;
        db.set("k", "one", HOUR).await.unwrap();
        db.set("k", "two", HOUR).await.unwrap();
        assert_eq!(db.get("k").await.unwrap().as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn set_if_absent_respects_live_values() {
        let db = test_db().await;
        assert!(db.set_if_absent("k", "first", HOUR).await.unwrap());
        assert!(!db.set_if_absent("k", "second", HOUR).await.unwrap());
        assert_eq!(db.get("k").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn zero_ttl_values_are_invisible_and_replaceable() {
        let db = test_db().await;
        db.set("k", "stale", Duration::ZERO).await.unwrap();
        assert!(db.get("k").await.unwrap().is_none());
        assert!(!db.exists("k").await.unwrap());
        assert!(db.set_if_absent("k", "fresh", HOUR).await.unwrap());
        assert_eq!(db.get("k").await.unwrap().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn delete_reports_removal() {
        let db = test_db().await;
        db.set("k", "v", HOUR).await.unwrap();
        assert!(db.delete("k").await.unwrap());
        assert!(!db.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let db = test_db().await;
        db.set("old", "v", Duration::ZERO).await.unwrap();
        db.set("new", "v", HOUR).await.unwrap();
        assert_eq!(db.purge_expired().await.unwrap(), 1);
        assert!(db.get("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn file_database_is_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let a = LibSqlBackend::new_local(&path).await.unwrap();
        let b = LibSqlBackend::new_local(&path).await.unwrap();
        a.set("shared", "yes", HOUR).await.unwrap();
        assert_eq!(b.get("shared").await.unwrap().as_deref(), Some("yes"));
    }
}
