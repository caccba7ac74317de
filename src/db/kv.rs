//! Key-value backends for the local store.
//!
//! Values are JSON strings addressed by `(namespace, key)`. The SQLite backend
//! is the durable one; the in-memory backend is what the store degrades to
//! when SQLite cannot be opened, and what tests use.

use crate::db::pool::DbPool;
use crate::error::AppError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// An async key-value store with namespaced keys.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Short name for logs.
    fn backend_tag(&self) -> &'static str;

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, AppError>;

    async fn put(&self, namespace: &str, key: &str, value: &str) -> Result<(), AppError>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, namespace: &str, key: &str) -> Result<(), AppError>;

    /// All `(key, value)` pairs of a namespace, ordered by key.
    async fn get_all(&self, namespace: &str) -> Result<Vec<(String, String)>, AppError>;
}

/// Get the current Unix timestamp.
fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Durable backend over the `kv_entries` table.
#[derive(Debug, Clone)]
pub struct SqliteKvBackend {
    pool: DbPool,
}

impl SqliteKvBackend {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl KvBackend for SqliteKvBackend {
    fn backend_tag(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, AppError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM kv_entries WHERE namespace = ? AND key = ?")
                .bind(namespace)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(value,)| value))
    }

    async fn put(&self, namespace: &str, key: &str, value: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (namespace, key, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(value)
        .bind(now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM kv_entries WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_all(&self, namespace: &str) -> Result<Vec<(String, String)>, AppError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM kv_entries WHERE namespace = ? ORDER BY key")
                .bind(namespace)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows)
    }
}

/// Volatile backend. Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryKvBackend {
    entries: RwLock<BTreeMap<(String, String), String>>,
    fail_writes: AtomicBool,
}

impl MemoryKvBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail, to exercise error paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvBackend for MemoryKvBackend {
    fn backend_tag(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, AppError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn put(&self, namespace: &str, key: &str, value: &str) -> Result<(), AppError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::database_with_op("write rejected", "put"));
        }
        self.entries
            .write()
            .await
            .insert((namespace.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), AppError> {
        self.entries
            .write()
            .await
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    async fn get_all(&self, namespace: &str) -> Result<Vec<(String, String)>, AppError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn exercise(backend: &dyn KvBackend) {
        backend.put("apps", "b-app", "{\"id\":\"b-app\"}").await.unwrap();
        backend.put("apps", "a-app", "{\"id\":\"a-app\"}").await.unwrap();
        backend.put("ideas", "i1", "{}").await.unwrap();

        assert_eq!(
            backend.get("apps", "a-app").await.unwrap().as_deref(),
            Some("{\"id\":\"a-app\"}")
        );
        assert!(backend.get("apps", "missing").await.unwrap().is_none());

        let all = backend.get_all("apps").await.unwrap();
        let keys: Vec<&str> = all.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a-app", "b-app"]);

        backend.put("apps", "a-app", "{\"id\":\"a-app\",\"v\":2}").await.unwrap();
        assert!(backend.get("apps", "a-app").await.unwrap().unwrap().contains("\"v\":2"));

        backend.delete("apps", "a-app").await.unwrap();
        backend.delete("apps", "a-app").await.unwrap();
        assert_eq!(backend.get_all("apps").await.unwrap().len(), 1);
        assert_eq!(backend.get_all("ideas").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_backend() {
        let backend = MemoryKvBackend::new();
        exercise(&backend).await;
    }

    #[tokio::test]
    async fn test_sqlite_backend() {
        let dir = tempdir().unwrap();
        let pool = crate::db::initialize(&dir.path().join("kv.db")).await.unwrap();
        let backend = SqliteKvBackend::new(pool);
        exercise(&backend).await;
    }

    #[tokio::test]
    async fn test_sqlite_backend_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kv.db");

        {
            let pool = crate::db::initialize(&path).await.unwrap();
            SqliteKvBackend::new(pool.clone())
                .put("queue", "pending", "[1]")
                .await
                .unwrap();
            pool.close().await;
        }

        let pool = crate::db::initialize(&path).await.unwrap();
        let value = SqliteKvBackend::new(pool).get("queue", "pending").await.unwrap();
        assert_eq!(value.as_deref(), Some("[1]"));
    }

    #[tokio::test]
    async fn test_memory_backend_write_failure() {
        let backend = MemoryKvBackend::new();
        backend.set_fail_writes(true);
        assert!(backend.put("apps", "x", "{}").await.is_err());
    }
}
