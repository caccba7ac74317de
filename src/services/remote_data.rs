//! Reads and writes against the remote dataset.
//!
//! Every write is a compare-and-swap on the blob's version token. The token
//! used as precondition is the one observed at the last read of the same
//! path, so a change made by someone else between our read and our write is
//! reported as a conflict instead of being overwritten.

use crate::config::PortfolioConfig;
use crate::error::AppError;
use crate::models::{AppRecord, IdeaRecord, OperationType, ReviewRecord, SourceRepository, TaskRecord};
use crate::services::blob_store::{Blob, BlobStore, SourceListing};
use crate::services::codec;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// Result of a remote write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Written; the local read cache for the path was refreshed.
    Ok,
    /// The remote changed since it was last read. Nothing was written.
    Conflict,
    /// Transient failure. Safe to retry later.
    Queued { reason: String },
    /// Permanent failure (authentication, validation, bad payload).
    Failed { reason: String },
}

impl WriteOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// The overview manifest is either a bare array or `{"apps": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum OverviewDocument {
    Bare(Vec<AppRecord>),
    Wrapped { apps: Vec<AppRecord> },
}

#[derive(Debug, Clone)]
struct CachedBlob {
    blob: Option<Blob>,
    fetched_at: Instant,
}

#[derive(Debug, Default)]
struct CircuitState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Opens after a run of retryable failures and fails fast until the
/// cooldown has passed.
#[derive(Debug)]
struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(CircuitState::default()),
        }
    }

    async fn allow(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.open_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                // Cooldown over: let one attempt through
                state.open_until = None;
                true
            }
            None => true,
        }
    }

    async fn is_open(&self) -> bool {
        let state = self.state.lock().await;
        state.open_until.is_some_and(|until| Instant::now() < until)
    }

    async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            log::warn!(
                "[remote] {} consecutive failures, pausing remote calls for {:?}",
                state.consecutive_failures,
                self.cooldown
            );
            state.open_until = Some(Instant::now() + self.cooldown);
            state.consecutive_failures = 0;
        }
    }
}

/// Client for the remote dataset and the repository enumeration.
pub struct RemoteDataClient {
    store: Arc<dyn BlobStore>,
    listing: Arc<dyn SourceListing>,
    owner: String,
    data_root: String,
    cache_ttl: Duration,
    timeout: Duration,
    cache: RwLock<HashMap<String, CachedBlob>>,
    /// Token observed at the last read of each path (`None`: blob absent).
    tokens: RwLock<HashMap<String, Option<String>>>,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    circuit: CircuitBreaker,
}

impl RemoteDataClient {
    pub fn new(
        store: Arc<dyn BlobStore>,
        listing: Arc<dyn SourceListing>,
        config: &PortfolioConfig,
    ) -> Self {
        Self {
            store,
            listing,
            owner: config.github.owner.clone(),
            data_root: config.data_root.trim_matches('/').to_string(),
            cache_ttl: config.read_cache_ttl(),
            timeout: Duration::from_secs(config.github.timeout_secs.max(1)),
            cache: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
            circuit: CircuitBreaker::new(
                config.circuit.failure_threshold,
                Duration::from_secs(config.circuit.cooldown_secs),
            ),
        }
    }

    // Paths

    fn data_path(&self, relative: &str) -> String {
        if self.data_root.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.data_root, relative)
        }
    }

    pub fn overview_path(&self) -> String {
        self.data_path("overview.json")
    }

    pub fn tasks_path(&self, app_id: &str) -> String {
        self.data_path(&format!("apps/{}/tasks.json", app_id))
    }

    pub fn reviews_path(&self, app_id: &str) -> String {
        self.data_path(&format!("apps/{}/reviews.json", app_id))
    }

    pub fn ideas_dir(&self) -> String {
        self.data_path("ideas")
    }

    pub fn idea_path(&self, idea_id: &str) -> String {
        self.data_path(&format!("ideas/{}.yml", idea_id))
    }

    /// Whether remote calls are currently short-circuited.
    pub async fn is_circuit_open(&self) -> bool {
        self.circuit.is_open().await
    }

    /// Run one remote call under the circuit breaker and the timeout.
    async fn call<T, F>(&self, what: &str, fut: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        if !self.circuit.allow().await {
            return Err(AppError::network(format!(
                "Remote paused after repeated failures ({})",
                what
            )));
        }

        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AppError::network(format!(
                "{} timed out after {}s",
                what,
                self.timeout.as_secs()
            ))),
        };

        match &result {
            Err(e) if e.is_retryable() => self.circuit.record_failure().await,
            // Any answer from the remote, even a refusal, means it is reachable
            _ => self.circuit.record_success().await,
        }
        result
    }

    /// Read a blob, through the cache unless `bypass_cache`.
    async fn read_blob(&self, path: &str, bypass_cache: bool) -> Result<Option<Blob>, AppError> {
        if !bypass_cache {
            if let Some(cached) = self.cache.read().await.get(path) {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(cached.blob.clone());
                }
            }
        }

        let blob = self.call(path, self.store.read(path)).await?;
        log::debug!(
            "[remote] Read {} ({})",
            path,
            if blob.is_some() { "present" } else { "missing" }
        );

        self.tokens.write().await.insert(
            path.to_string(),
            blob.as_ref().map(|b| b.version_token.clone()),
        );
        self.cache.write().await.insert(
            path.to_string(),
            CachedBlob {
                blob: blob.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(blob)
    }

    // Reads

    /// All apps listed in the overview manifest.
    ///
    /// A missing manifest is `NotFound` and an unparsable one `Malformed`;
    /// neither is reported as an empty list.
    pub async fn fetch_overview(&self) -> Result<Vec<AppRecord>, AppError> {
        let path = self.overview_path();
        let blob = self
            .read_blob(&path, false)
            .await?
            .ok_or_else(|| AppError::not_found_with_id("overview", path.clone()))?;

        let apps = match codec::decode::<OverviewDocument>(&path, &blob.content)? {
            OverviewDocument::Bare(apps) => apps,
            OverviewDocument::Wrapped { apps } => apps,
        };
        Ok(apps)
    }

    /// Task list of an app. A missing blob is an empty list.
    pub async fn fetch_tasks(&self, app_id: &str, bypass_cache: bool) -> Result<Vec<TaskRecord>, AppError> {
        validate_id(app_id, "app_id")?;
        let path = self.tasks_path(app_id);
        match self.read_blob(&path, bypass_cache).await? {
            Some(blob) => codec::decode(&path, &blob.content),
            None => Ok(Vec::new()),
        }
    }

    /// Review history of an app. A missing blob is an empty list.
    pub async fn fetch_reviews(&self, app_id: &str, bypass_cache: bool) -> Result<Vec<ReviewRecord>, AppError> {
        validate_id(app_id, "app_id")?;
        let path = self.reviews_path(app_id);
        match self.read_blob(&path, bypass_cache).await? {
            Some(blob) => codec::decode(&path, &blob.content),
            None => Ok(Vec::new()),
        }
    }

    /// One idea document.
    pub async fn fetch_idea(&self, idea_id: &str, bypass_cache: bool) -> Result<Option<IdeaRecord>, AppError> {
        validate_id(idea_id, "idea_id")?;
        let path = self.idea_path(idea_id);
        match self.read_blob(&path, bypass_cache).await? {
            Some(blob) => codec::decode(&path, &blob.content).map(Some),
            None => Ok(None),
        }
    }

    /// Every idea document in the ideas directory.
    ///
    /// A document that fails to parse is skipped with a warning so one bad
    /// file does not hide the rest.
    pub async fn fetch_ideas(&self, bypass_cache: bool) -> Result<Vec<IdeaRecord>, AppError> {
        let dir = self.ideas_dir();
        let paths = self.call(&dir, self.store.list(&dir)).await?;

        let mut ideas = Vec::new();
        for path in paths {
            if !(path.ends_with(".yml") || path.ends_with(".yaml") || path.ends_with(".json")) {
                continue;
            }
            let Some(blob) = self.read_blob(&path, bypass_cache).await? else {
                continue;
            };
            match codec::decode::<IdeaRecord>(&path, &blob.content) {
                Ok(idea) => ideas.push(idea),
                Err(e) => log::warn!("[remote] Skipping idea {}: {}", path, e),
            }
        }
        Ok(ideas)
    }

    /// Live listing of the configured owner's repositories.
    pub async fn enumerate_source(&self) -> Result<Vec<SourceRepository>, AppError> {
        self.call("repository listing", self.listing.list_repositories(&self.owner))
            .await
    }

    // Writes

    pub async fn write_tasks(&self, app_id: &str, tasks: &[TaskRecord]) -> WriteOutcome {
        if let Err(e) = validate_id(app_id, "app_id") {
            return WriteOutcome::Failed { reason: e.to_string() };
        }
        let path = self.tasks_path(app_id);
        self.write_encoded(&path, tasks, &format!("Update tasks for {}", app_id))
            .await
    }

    pub async fn write_reviews(&self, app_id: &str, reviews: &[ReviewRecord]) -> WriteOutcome {
        if let Err(e) = validate_id(app_id, "app_id") {
            return WriteOutcome::Failed { reason: e.to_string() };
        }
        let path = self.reviews_path(app_id);
        self.write_encoded(&path, reviews, &format!("Update reviews for {}", app_id))
            .await
    }

    pub async fn write_idea(&self, idea: &IdeaRecord) -> WriteOutcome {
        if let Err(e) = validate_id(&idea.id, "idea_id") {
            return WriteOutcome::Failed { reason: e.to_string() };
        }
        let path = self.idea_path(&idea.id);
        self.write_encoded(&path, idea, &format!("Update idea {}", idea.id))
            .await
    }

    /// Write a queued payload with the typed writer for its operation.
    pub async fn write_operation(
        &self,
        op_type: OperationType,
        target_id: &str,
        payload: &serde_json::Value,
    ) -> WriteOutcome {
        match op_type {
            OperationType::Tasks => match serde_json::from_value::<Vec<TaskRecord>>(payload.clone()) {
                Ok(tasks) => self.write_tasks(target_id, &tasks).await,
                Err(e) => payload_mismatch(op_type, e),
            },
            OperationType::Reviews => match serde_json::from_value::<Vec<ReviewRecord>>(payload.clone()) {
                Ok(reviews) => self.write_reviews(target_id, &reviews).await,
                Err(e) => payload_mismatch(op_type, e),
            },
            OperationType::Ideas => match serde_json::from_value::<IdeaRecord>(payload.clone()) {
                Ok(idea) if idea.id == target_id => self.write_idea(&idea).await,
                Ok(idea) => WriteOutcome::Failed {
                    reason: format!("Idea id {} does not match target {}", idea.id, target_id),
                },
                Err(e) => payload_mismatch(op_type, e),
            },
        }
    }

    async fn write_encoded<T: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        value: &T,
        message: &str,
    ) -> WriteOutcome {
        match codec::encode(path, value) {
            Ok(content) => self.write_blob(path, &content, message).await,
            Err(e) => WriteOutcome::Failed { reason: e.to_string() },
        }
    }

    async fn path_lock(&self, path: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .lock()
            .await
            .entry(path.to_string())
            .or_default()
            .clone()
    }

    /// Compare-and-swap write of one blob.
    async fn write_blob(&self, path: &str, content: &str, message: &str) -> WriteOutcome {
        let lock = self.path_lock(path).await;
        let _guard = lock.lock().await;

        let known = self.tokens.read().await.get(path).cloned();
        let expected = match known {
            Some(token) => token,
            None => match self.read_blob(path, true).await {
                Ok(blob) => blob.map(|b| b.version_token),
                Err(e) => return self.outcome_for(path, e),
            },
        };

        match self
            .call(path, self.store.write(path, content, expected.as_deref(), message))
            .await
        {
            Ok(token) => {
                self.cache.write().await.remove(path);
                self.tokens.write().await.insert(path.to_string(), Some(token));
                log::info!("[remote] Wrote {}", path);
                WriteOutcome::Ok
            }
            Err(e) => self.outcome_for(path, e),
        }
    }

    fn outcome_for(&self, path: &str, error: AppError) -> WriteOutcome {
        if error.is_conflict() {
            log::warn!("[remote] Conflict writing {}: remote changed since last read", path);
            WriteOutcome::Conflict
        } else if error.is_retryable() {
            log::warn!("[remote] Write to {} deferred: {}", path, error);
            WriteOutcome::Queued {
                reason: error.to_string(),
            }
        } else {
            log::error!("[remote] Write to {} failed: {}", path, error);
            WriteOutcome::Failed {
                reason: error.to_string(),
            }
        }
    }

    // Cache control

    /// Drop the cached content of one path.
    pub async fn invalidate(&self, path: &str) {
        self.cache.write().await.remove(path);
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }
}

fn payload_mismatch(op_type: OperationType, error: serde_json::Error) -> WriteOutcome {
    WriteOutcome::Failed {
        reason: format!("Payload does not match {}: {}", op_type, error),
    }
}

/// Ids become path segments; reject anything that could escape them.
fn validate_id(id: &str, field: &str) -> Result<(), AppError> {
    if id.trim().is_empty() || id.contains('/') || id.contains("..") {
        return Err(AppError::invalid_input_field(
            format!("Invalid identifier '{}'", id),
            field,
        ));
    }
    Ok(())
}
