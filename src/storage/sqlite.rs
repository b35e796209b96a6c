// SQLite-backed storage for the local area

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use super::{ChangeNotifier, KeyValueStore, StorageChange, LOCAL_AREA};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv_store (
    area TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (area, key)
)";

/// Persistent key/value store in a single SQLite file.
///
/// rusqlite is blocking, so every call runs on the blocking pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    notifier: ChangeNotifier,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create storage directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        conn.execute(SCHEMA, [])
            .context("Failed to initialize kv_store table")?;

        tracing::info!("Opened local storage: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
            notifier: ChangeNotifier::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("SQLite connection lock poisoned"))?;
            f(&guard)
        })
        .await
        .context("SQLite task failed")?
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let key = key.to_string();
        let raw: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT value FROM kv_store WHERE area = ?1 AND key = ?2",
                    [LOCAL_AREA, key.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .with_context(|| format!("Failed to read key: {}", key))
            })
            .await?;

        raw.map(|s| serde_json::from_str(&s).context("Failed to parse stored value"))
            .transpose()
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let owned_key = key.to_string();
        let encoded = serde_json::to_string(&value).context("Failed to encode value")?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv_store (area, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(area, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                [
                    LOCAL_AREA,
                    owned_key.as_str(),
                    encoded.as_str(),
                    Utc::now().to_rfc3339().as_str(),
                ],
            )
            .with_context(|| format!("Failed to write key: {}", owned_key))?;
            Ok(())
        })
        .await?;

        self.notifier.publish(key, Some(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let owned_key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM kv_store WHERE area = ?1 AND key = ?2",
                [LOCAL_AREA, owned_key.as_str()],
            )
            .with_context(|| format!("Failed to remove key: {}", owned_key))?;
            Ok(())
        })
        .await?;

        self.notifier.publish(key, None);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("storage.sqlite3");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .set("pendingClippings", json!([{"tempId": "temp_1_abc"}]))
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.get("pendingClippings").await.unwrap(),
            Some(json!([{"tempId": "temp_1_abc"}]))
        );
    }

    #[tokio::test]
    async fn test_overwrite_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("s.db")).unwrap();
        let mut rx = store.subscribe();

        store.set("userProfile", json!({"a": 1})).await.unwrap();
        store.set("userProfile", json!({"a": 2})).await.unwrap();
        assert_eq!(
            store.get("userProfile").await.unwrap(),
            Some(json!({"a": 2}))
        );

        store.remove("userProfile").await.unwrap();
        assert!(store.get("userProfile").await.unwrap().is_none());

        assert_eq!(rx.recv().await.unwrap().new_value, Some(json!({"a": 1})));
        assert_eq!(rx.recv().await.unwrap().new_value, Some(json!({"a": 2})));
        assert_eq!(rx.recv().await.unwrap().new_value, None);
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("s.db")).unwrap();
        assert!(store.get("nothing").await.unwrap().is_none());
    }
}
