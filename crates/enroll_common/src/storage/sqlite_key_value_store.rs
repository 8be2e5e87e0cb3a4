use crate::domain::DomainResult;
use crate::storage::KeyValueStore;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, instrument};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable KeyValueStore backed by a single SQLite table.
///
/// Each value is stored as its JSON text. Calls run on the blocking pool so
/// the async executor never waits on disk I/O.
#[derive(Clone)]
pub struct SqliteKeyValueStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKeyValueStore {
    /// Open (creating if needed) the database file at `path`
    pub fn open(path: impl AsRef<Path>) -> DomainResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database {}", path.display()))?;
        debug!(path = %path.display(), "opened sqlite key-value store");
        Self::bootstrap(conn)
    }

    pub fn in_memory() -> DomainResult<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> DomainResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("failed to set sqlite busy timeout")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )
        .context("failed to create kv_store table")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_connection<T, F>(&self, op: F) -> DomainResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow!("sqlite connection mutex poisoned"))?;
            op(&guard)
        })
        .await
        .map_err(|e| anyhow!("sqlite task failed: {}", e))??;
        Ok(result)
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> DomainResult<Option<Value>> {
        let key = key.to_string();
        let raw = self
            .with_connection(move |conn| {
                let raw: Option<String> = conn
                    .query_row(
                        "SELECT value FROM kv_store WHERE key = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()
                    .context("failed to read kv_store")?;
                Ok(raw)
            })
            .await?;

        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: Value) -> DomainResult<()> {
        let key = key.to_string();
        let text = serde_json::to_string(&value)?;
        let updated_at = chrono::Utc::now().to_rfc3339();
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, text, updated_at],
            )
            .context("failed to write kv_store")?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_then_get() {
        let store = SqliteKeyValueStore::in_memory().unwrap();
        store.set("a", json!([1, 2, 3])).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!([1, 2, 3])));
        assert_eq!(store.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let store = SqliteKeyValueStore::in_memory().unwrap();
        store.set("a", json!({"v": 1})).await.unwrap();
        store.set("a", json!({"v": 2})).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enroll.db");

        {
            let store = SqliteKeyValueStore::open(&path).unwrap();
            store
                .set("enrollment.allocated_ids", json!([99, 100]))
                .await
                .unwrap();
        }

        let reopened = SqliteKeyValueStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("enrollment.allocated_ids").await.unwrap(),
            Some(json!([99, 100]))
        );
    }
}
