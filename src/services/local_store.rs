//! Typed local cache.
//!
//! Records are stored as JSON documents in a `KvBackend`, one namespace per
//! collection:
//! - `apps`: one record per app, tasks embedded
//! - `ideas`: one record per idea, comments embedded
//! - `reviews`: one history document per app
//! - `queue`: the pending offline queue as a single document

use crate::db::kv::{KvBackend, MemoryKvBackend, SqliteKvBackend};
use crate::error::AppError;
use crate::models::{AppRecord, IdeaRecord, QueuedOperation, ReviewRecord, TaskRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

const NS_APPS: &str = "apps";
const NS_IDEAS: &str = "ideas";
const NS_REVIEWS: &str = "reviews";
const NS_QUEUE: &str = "queue";
const QUEUE_KEY: &str = "pending";

/// Key-indexed persistent cache of portfolio records.
#[derive(Clone)]
pub struct LocalStore {
    backend: Arc<dyn KvBackend>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("backend", &self.backend.backend_tag())
            .finish()
    }
}

impl LocalStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// A store that forgets everything when dropped.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKvBackend::new()))
    }

    /// Open the SQLite cache at `db_path`.
    ///
    /// Without a path, or when SQLite cannot be opened, the store degrades
    /// to memory. The degradation is logged once and is otherwise invisible
    /// to callers.
    pub async fn open(db_path: Option<&Path>) -> Self {
        let Some(path) = db_path else {
            log::info!("[store] No database path configured, using in-memory store");
            return Self::in_memory();
        };

        match crate::db::initialize(path).await {
            Ok(pool) => {
                log::info!("[store] Opened local cache at {}", path.display());
                Self::new(Arc::new(SqliteKvBackend::new(pool)))
            }
            Err(e) => {
                log::warn!(
                    "[store] Local cache unavailable ({}), falling back to memory: {}",
                    path.display(),
                    e
                );
                Self::in_memory()
            }
        }
    }

    /// Whether contents survive a restart.
    pub fn is_durable(&self) -> bool {
        self.backend.backend_tag() != "memory"
    }

    async fn get_json<T: DeserializeOwned>(&self, ns: &str, key: &str) -> Result<Option<T>, AppError> {
        match self.backend.get(ns, key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| AppError::malformed_at(e.to_string(), format!("{}/{}", ns, key))),
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize + ?Sized>(&self, ns: &str, key: &str, value: &T) -> Result<(), AppError> {
        let raw = serde_json::to_string(value)?;
        self.backend.put(ns, key, &raw).await
    }

    /// Every decodable record of a namespace. Corrupt entries are skipped.
    async fn get_all_json<T: DeserializeOwned>(&self, ns: &str) -> Result<Vec<T>, AppError> {
        let rows = self.backend.get_all(ns).await?;
        let mut records = Vec::with_capacity(rows.len());
        for (key, raw) in rows {
            match serde_json::from_str(&raw) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("[store] Skipping corrupt {}/{}: {}", ns, key, e),
            }
        }
        Ok(records)
    }

    // Apps

    pub async fn get_app(&self, id: &str) -> Result<Option<AppRecord>, AppError> {
        self.get_json(NS_APPS, id).await
    }

    pub async fn get_all_apps(&self) -> Result<Vec<AppRecord>, AppError> {
        self.get_all_json(NS_APPS).await
    }

    pub async fn put_app(&self, app: &AppRecord) -> Result<(), AppError> {
        if app.id.is_empty() {
            return Err(AppError::invalid_input_field("App id must not be empty", "id"));
        }
        self.put_json(NS_APPS, &app.id, app).await
    }

    pub async fn put_apps(&self, apps: &[AppRecord]) -> Result<(), AppError> {
        for app in apps {
            self.put_app(app).await?;
        }
        Ok(())
    }

    /// Delete an app together with its review history.
    pub async fn delete_app(&self, id: &str) -> Result<(), AppError> {
        self.backend.delete(NS_APPS, id).await?;
        self.backend.delete(NS_REVIEWS, id).await
    }

    // Tasks

    /// Tasks of an app. An unknown app has no tasks.
    pub async fn get_tasks(&self, app_id: &str) -> Result<Vec<TaskRecord>, AppError> {
        Ok(self
            .get_app(app_id)
            .await?
            .map(|app| app.tasks)
            .unwrap_or_default())
    }

    /// Replace the task list of an app, creating a bare record if needed.
    pub async fn put_tasks(&self, app_id: &str, tasks: &[TaskRecord]) -> Result<(), AppError> {
        let mut app = self
            .get_app(app_id)
            .await?
            .unwrap_or_else(|| bare_app(app_id));
        app.tasks = tasks.to_vec();
        self.put_app(&app).await
    }

    // Reviews

    pub async fn get_reviews(&self, app_id: &str) -> Result<Vec<ReviewRecord>, AppError> {
        Ok(self.get_json(NS_REVIEWS, app_id).await?.unwrap_or_default())
    }

    pub async fn put_reviews(&self, app_id: &str, reviews: &[ReviewRecord]) -> Result<(), AppError> {
        self.put_json(NS_REVIEWS, app_id, reviews).await
    }

    // Ideas

    pub async fn get_idea(&self, id: &str) -> Result<Option<IdeaRecord>, AppError> {
        self.get_json(NS_IDEAS, id).await
    }

    pub async fn get_all_ideas(&self) -> Result<Vec<IdeaRecord>, AppError> {
        self.get_all_json(NS_IDEAS).await
    }

    pub async fn put_idea(&self, idea: &IdeaRecord) -> Result<(), AppError> {
        if idea.id.is_empty() {
            return Err(AppError::invalid_input_field("Idea id must not be empty", "id"));
        }
        self.put_json(NS_IDEAS, &idea.id, idea).await
    }

    /// Replace the stored idea set: upsert every idea, delete the rest.
    pub async fn replace_ideas(&self, ideas: &[IdeaRecord]) -> Result<(), AppError> {
        let keep: std::collections::HashSet<&str> = ideas.iter().map(|i| i.id.as_str()).collect();
        for (key, _) in self.backend.get_all(NS_IDEAS).await? {
            if !keep.contains(key.as_str()) {
                self.backend.delete(NS_IDEAS, &key).await?;
            }
        }
        for idea in ideas {
            self.put_idea(idea).await?;
        }
        Ok(())
    }

    pub async fn delete_idea(&self, id: &str) -> Result<(), AppError> {
        self.backend.delete(NS_IDEAS, id).await
    }

    // Queue

    /// The persisted offline queue, in FIFO order.
    pub async fn load_queue(&self) -> Result<Vec<QueuedOperation>, AppError> {
        Ok(self.get_json(NS_QUEUE, QUEUE_KEY).await?.unwrap_or_default())
    }

    pub async fn save_queue(&self, operations: &[QueuedOperation]) -> Result<(), AppError> {
        self.put_json(NS_QUEUE, QUEUE_KEY, operations).await
    }
}

/// Placeholder record for an app known only by id.
fn bare_app(app_id: &str) -> AppRecord {
    let mut app = AppRecord::new(app_id);
    app.id = app_id.to_string();
    app
}
