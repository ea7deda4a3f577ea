//! Asynchronous key-value substrate shared by every persisted collection.
//!
//! The engine only ever needs four primitives: `get`, `set`, `keys` and
//! `delete`. Anything satisfying that contract can back the app — the
//! in-memory store is used by tests, the sqlite store by the running app.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::RwLock;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

impl dyn KvStore {
    /// Fetch a key and deserialize it into a concrete record type.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => {
                let parsed = serde_json::from_value(value)
                    .with_context(|| format!("malformed record under key '{key}'"))?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let encoded =
            serde_json::to_value(value).with_context(|| format!("encoding key '{key}'"))?;
        self.set(key, encoded).await
    }
}

/// Volatile store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Durable store over a single sqlite table.
///
/// Operations are short single-row statements, so the connection sits behind
/// a plain mutex rather than a connection pool.
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).context("opening kv database")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory kv database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )
        .context("creating kv_entries table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("kv store lock poisoned: {}", e))
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.lock_conn()?;
        let row = conn.query_row(
            "SELECT value FROM kv_entries WHERE key = ?1",
            [key],
            |row| row.get::<_, String>(0),
        );
        match row {
            Ok(raw) => {
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("malformed json under key '{key}'"))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let raw = serde_json::to_string(&value)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv_entries (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, raw, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT key FROM kv_entries ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM kv_entries WHERE key = ?1", [key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryKvStore::new();
        store.set("alpha", json!({"n": 1})).await.unwrap();
        assert_eq!(store.get("alpha").await.unwrap(), Some(json!({"n": 1})));

        store.delete("alpha").await.unwrap();
        assert_eq!(store.get("alpha").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteKvStore::open(dir.path().join("kv.db")).unwrap();

        store.set("facts:global", json!([{"id": "f1"}])).await.unwrap();
        store.set("characters", json!([])).await.unwrap();

        let mut keys = store.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["characters", "facts:global"]);

        assert_eq!(
            store.get("facts:global").await.unwrap(),
            Some(json!([{"id": "f1"}]))
        );

        store.delete("facts:global").await.unwrap();
        assert_eq!(store.get("facts:global").await.unwrap(), None);
    }

    #[tokio::test]
    async fn typed_helpers_roundtrip() {
        let store: std::sync::Arc<dyn KvStore> = std::sync::Arc::new(MemoryKvStore::new());
        store.set_json("nums", &vec![1u32, 2, 3]).await.unwrap();
        let back: Option<Vec<u32>> = store.get_json("nums").await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
    }
}
