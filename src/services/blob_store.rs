//! Remote storage interfaces.
//!
//! `BlobStore` is the versioned blob store holding the dataset;
//! `SourceListing` enumerates the owner's repositories. `GitHubClient`
//! implements both against the GitHub REST API. The in-memory
//! implementations here back offline operation and tests.

use crate::error::AppError;
use crate::models::SourceRepository;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};

/// Blob content together with its version token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub content: String,
    pub version_token: String,
}

/// A path-addressed blob store guarded by version tokens.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a blob. A missing blob is `Ok(None)`.
    async fn read(&self, path: &str) -> Result<Option<Blob>, AppError>;

    /// Write a blob and return its new version token.
    ///
    /// `expected_token` must match the current token (`None` creates a new
    /// blob). A mismatch fails with `RemoteConflict` and leaves the blob
    /// untouched.
    async fn write(
        &self,
        path: &str,
        content: &str,
        expected_token: Option<&str>,
        message: &str,
    ) -> Result<String, AppError>;

    /// Paths of the blobs directly inside `dir`. A missing directory is empty.
    async fn list(&self, dir: &str) -> Result<Vec<String>, AppError>;
}

/// Live enumeration of an owner's repositories.
#[async_trait]
pub trait SourceListing: Send + Sync {
    async fn list_repositories(&self, owner: &str) -> Result<Vec<SourceRepository>, AppError>;
}

/// SHA-256 hex digest of blob content.
pub fn content_token(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// In-memory blob store with content-hash version tokens.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Blob>>,
    offline: AtomicBool,
    injected: Mutex<VecDeque<AppError>>,
    writes: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put content at a path without any token check, as another writer would.
    pub async fn insert(&self, path: &str, content: impl Into<String>) -> String {
        let content = content.into();
        let token = content_token(&content);
        self.blobs.write().await.insert(
            path.to_string(),
            Blob {
                content,
                version_token: token.clone(),
            },
        );
        token
    }

    pub async fn remove(&self, path: &str) {
        self.blobs.write().await.remove(path);
    }

    /// Current content at a path.
    pub async fn content(&self, path: &str) -> Option<String> {
        self.blobs.read().await.get(path).map(|b| b.content.clone())
    }

    /// While offline every call fails with `NetworkUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make the next call (read, write or list) fail with `error`.
    pub async fn inject_failure(&self, error: AppError) {
        self.injected.lock().await.push_back(error);
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    async fn check_available(&self) -> Result<(), AppError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AppError::network("Blob store offline"));
        }
        if let Some(error) = self.injected.lock().await.pop_front() {
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, path: &str) -> Result<Option<Blob>, AppError> {
        self.check_available().await?;
        Ok(self.blobs.read().await.get(path).cloned())
    }

    async fn write(
        &self,
        path: &str,
        content: &str,
        expected_token: Option<&str>,
        _message: &str,
    ) -> Result<String, AppError> {
        self.check_available().await?;

        let mut blobs = self.blobs.write().await;
        let current = blobs.get(path).map(|b| b.version_token.as_str());
        if current != expected_token {
            return Err(AppError::conflict_with_message(
                path,
                "Version token does not match",
            ));
        }

        let token = content_token(content);
        blobs.insert(
            path.to_string(),
            Blob {
                content: content.to_string(),
                version_token: token.clone(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(token)
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>, AppError> {
        self.check_available().await?;

        let prefix = format!("{}/", dir.trim_end_matches('/'));
        Ok(self
            .blobs
            .read()
            .await
            .keys()
            .filter(|path| {
                path.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .cloned()
            .collect())
    }
}

/// Fixed repository listing.
#[derive(Debug, Default)]
pub struct StaticSourceListing {
    repos: RwLock<Vec<SourceRepository>>,
    offline: AtomicBool,
}

impl StaticSourceListing {
    pub fn new(repos: Vec<SourceRepository>) -> Self {
        Self {
            repos: RwLock::new(repos),
            offline: AtomicBool::new(false),
        }
    }

    pub async fn set_repositories(&self, repos: Vec<SourceRepository>) {
        *self.repos.write().await = repos;
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceListing for StaticSourceListing {
    async fn list_repositories(&self, _owner: &str) -> Result<Vec<SourceRepository>, AppError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AppError::network("Repository listing offline"));
        }
        Ok(self.repos.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_requires_matching_token() {
        let store = MemoryBlobStore::new();
        let token = store.write("data/a.json", "[]", None, "create").await.unwrap();
        assert_eq!(token, content_token("[]"));

        // Creating again without a token conflicts
        let err = store.write("data/a.json", "[1]", None, "again").await.unwrap_err();
        assert!(err.is_conflict());

        let err = store
            .write("data/a.json", "[1]", Some("stale"), "stale")
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.content("data/a.json").await.as_deref(), Some("[]"));

        let next = store
            .write("data/a.json", "[1]", Some(&token), "update")
            .await
            .unwrap();
        assert_ne!(next, token);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_list_is_one_level() {
        let store = MemoryBlobStore::new();
        store.insert("data/ideas/a.yml", "id: a").await;
        store.insert("data/ideas/b.yml", "id: b").await;
        store.insert("data/ideas/archive/c.yml", "id: c").await;
        store.insert("data/overview.json", "[]").await;

        let listed = store.list("data/ideas").await.unwrap();
        assert_eq!(listed, vec!["data/ideas/a.yml", "data/ideas/b.yml"]);
        assert!(store.list("data/none").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_and_injected_failures() {
        let store = MemoryBlobStore::new();
        store.set_offline(true);
        assert!(store.read("x.json").await.unwrap_err().is_retryable());
        store.set_offline(false);

        store
            .inject_failure(AppError::remote_api_full("boom", 503, "/x"))
            .await;
        assert!(store.read("x.json").await.is_err());
        assert!(store.read("x.json").await.unwrap().is_none());
    }
}
