//! Single entry point for every mutation.
//!
//! A save is always applied to the local store first, then written to the
//! remote. The remote outcome is translated into a `SaveResult`; transient
//! failures are handed to the offline queue. Expected failures (offline,
//! conflict, refusal) are never errors: only a malformed request is.

use crate::config::PortfolioConfig;
use crate::error::AppError;
use crate::models::review::latest_review_date;
use crate::models::{IdeaRecord, IdeaStatus, OperationType, QueuedOperation, ReviewRecord, TaskRecord};
use crate::services::local_store::LocalStore;
use crate::services::offline_queue::{Deliverer, OfflineQueue};
use crate::services::reconciler::Reconciler;
use crate::services::remote_data::{RemoteDataClient, WriteOutcome};
use crate::services::sync_events::{PortfolioEvent, SaveStatus, StateNotifier};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// User-facing result of a save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveResult {
    pub status: SaveStatus,
    pub message: String,
}

impl SaveResult {
    fn new(status: SaveStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == SaveStatus::Ok
    }
}

/// A payload checked against its operation type.
enum TypedPayload {
    Tasks(Vec<TaskRecord>),
    Reviews(Vec<ReviewRecord>),
    Idea(IdeaRecord),
}

fn decode_payload(
    op_type: OperationType,
    target_id: &str,
    payload: &Value,
) -> Result<TypedPayload, AppError> {
    if target_id.trim().is_empty() {
        return Err(AppError::invalid_input_field(
            "Target id must not be empty",
            "target_id",
        ));
    }

    let mismatch = |e: serde_json::Error| {
        AppError::invalid_input_field(
            format!("Payload is not a valid {} document: {}", op_type, e),
            "payload",
        )
    };

    match op_type {
        OperationType::Tasks => serde_json::from_value(payload.clone())
            .map(TypedPayload::Tasks)
            .map_err(mismatch),
        OperationType::Reviews => serde_json::from_value(payload.clone())
            .map(TypedPayload::Reviews)
            .map_err(mismatch),
        OperationType::Ideas => {
            let idea: IdeaRecord = serde_json::from_value(payload.clone()).map_err(mismatch)?;
            if idea.id != target_id {
                return Err(AppError::invalid_input_field(
                    format!("Idea id {} does not match target {}", idea.id, target_id),
                    "target_id",
                ));
            }
            Ok(TypedPayload::Idea(idea))
        }
    }
}

/// Coordinates local persistence, remote writes and the offline queue.
pub struct SyncOrchestrator {
    remote: Arc<RemoteDataClient>,
    store: LocalStore,
    queue: Arc<OfflineQueue>,
    reconciler: Arc<Reconciler>,
    notifier: Arc<StateNotifier>,
    config: Arc<PortfolioConfig>,
}

impl SyncOrchestrator {
    pub fn new(
        remote: Arc<RemoteDataClient>,
        store: LocalStore,
        queue: Arc<OfflineQueue>,
        reconciler: Arc<Reconciler>,
        notifier: Arc<StateNotifier>,
        config: Arc<PortfolioConfig>,
    ) -> Self {
        Self {
            remote,
            store,
            queue,
            reconciler,
            notifier,
            config,
        }
    }

    /// Save `payload` locally and remotely.
    ///
    /// Returns `Err` only for an empty target id or a payload that does not
    /// fit `op_type`.
    pub async fn try_save(
        &self,
        op_type: OperationType,
        target_id: &str,
        payload: Value,
    ) -> Result<SaveResult, AppError> {
        let typed = decode_payload(op_type, target_id, &payload)?;
        self.persist_local(op_type, target_id, &typed).await;

        let result = self.push(op_type, target_id, payload).await;
        self.report(op_type, target_id, &result);
        Ok(result)
    }

    /// Retry a save that ended in a conflict.
    ///
    /// The current remote document is fetched past the cache and handed to
    /// `reapply`, which returns the payload to write. The result is written
    /// once; if the remote changed yet again the conflict is returned.
    pub async fn retry_after_conflict<F>(
        &self,
        op_type: OperationType,
        target_id: &str,
        reapply: F,
    ) -> Result<SaveResult, AppError>
    where
        F: FnOnce(Value) -> Value,
    {
        if target_id.trim().is_empty() {
            return Err(AppError::invalid_input_field(
                "Target id must not be empty",
                "target_id",
            ));
        }

        let current = match self.fetch_current(op_type, target_id).await {
            Ok(current) => current,
            Err(e) => {
                log::warn!("[sync] Could not re-read {} {}: {}", op_type, target_id, e);
                let result = SaveResult::new(
                    SaveStatus::Failed,
                    format!("Could not re-read the remote copy: {}", e),
                );
                self.report(op_type, target_id, &result);
                return Ok(result);
            }
        };

        let payload = reapply(current);
        let typed = decode_payload(op_type, target_id, &payload)?;
        self.persist_local(op_type, target_id, &typed).await;

        let outcome = self.remote.write_operation(op_type, target_id, &payload).await;
        let result = self.result_for(op_type, target_id, payload, outcome).await;
        self.report(op_type, target_id, &result);
        Ok(result)
    }

    async fn fetch_current(&self, op_type: OperationType, target_id: &str) -> Result<Value, AppError> {
        let value = match op_type {
            OperationType::Tasks => serde_json::to_value(self.remote.fetch_tasks(target_id, true).await?)?,
            OperationType::Reviews => {
                serde_json::to_value(self.remote.fetch_reviews(target_id, true).await?)?
            }
            OperationType::Ideas => match self.remote.fetch_idea(target_id, true).await? {
                Some(idea) => serde_json::to_value(idea)?,
                None => Value::Null,
            },
        };
        Ok(value)
    }

    /// Apply a save to the local store and the in-memory snapshots.
    ///
    /// A local failure is logged and does not stop the remote write.
    async fn persist_local(&self, op_type: OperationType, target_id: &str, payload: &TypedPayload) {
        let result = match payload {
            TypedPayload::Tasks(tasks) => self.persist_tasks(target_id, tasks).await,
            TypedPayload::Reviews(reviews) => self.persist_reviews(target_id, reviews).await,
            TypedPayload::Idea(idea) => match self.store.put_idea(idea).await {
                Ok(()) => {
                    self.reconciler.set_idea_snapshot(idea).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };

        if let Err(e) = result {
            log::error!("[sync] Local save of {} {} failed: {}", op_type, target_id, e);
        }
    }

    async fn persist_tasks(&self, app_id: &str, tasks: &[TaskRecord]) -> Result<(), AppError> {
        self.store.put_tasks(app_id, tasks).await?;
        if let Some(app) = self.store.get_app(app_id).await? {
            self.reconciler.set_app_snapshot(&app).await;
        }
        Ok(())
    }

    async fn persist_reviews(&self, app_id: &str, reviews: &[ReviewRecord]) -> Result<(), AppError> {
        self.store.put_reviews(app_id, reviews).await?;

        if let Some(mut app) = self.store.get_app(app_id).await? {
            if let Some(latest) = latest_review_date(reviews) {
                app.record_review(latest, self.config.review_cycle_days);
                self.store.put_app(&app).await?;
            }
            self.reconciler.set_app_snapshot(&app).await;
        }
        Ok(())
    }

    async fn push(&self, op_type: OperationType, target_id: &str, payload: Value) -> SaveResult {
        if !self.queue.is_online() {
            return self.defer(op_type, target_id, payload, "offline").await;
        }
        // Writing past a waiting write would let the older payload land last
        if self.queue.has_pending(op_type, target_id).await {
            return self
                .defer(op_type, target_id, payload, "an earlier change is still waiting")
                .await;
        }

        let outcome = self.remote.write_operation(op_type, target_id, &payload).await;
        self.result_for(op_type, target_id, payload, outcome).await
    }

    async fn result_for(
        &self,
        op_type: OperationType,
        target_id: &str,
        payload: Value,
        outcome: WriteOutcome,
    ) -> SaveResult {
        match outcome {
            WriteOutcome::Ok => SaveResult::new(SaveStatus::Ok, "Saved"),
            WriteOutcome::Queued { reason } => self.defer(op_type, target_id, payload, &reason).await,
            WriteOutcome::Conflict => SaveResult::new(
                SaveStatus::Conflict,
                "The remote copy changed since it was loaded. Your change is kept locally.",
            ),
            WriteOutcome::Failed { reason } => SaveResult::new(
                SaveStatus::Failed,
                format!("Saved locally only: {}", reason),
            ),
        }
    }

    async fn defer(
        &self,
        op_type: OperationType,
        target_id: &str,
        payload: Value,
        reason: &str,
    ) -> SaveResult {
        match self.queue.enqueue(op_type, target_id, payload).await {
            Ok(_) => SaveResult::new(
                SaveStatus::Queued,
                format!("Saved offline, will sync later ({})", reason),
            ),
            Err(e) => SaveResult::new(
                SaveStatus::Failed,
                format!("Saved locally only, could not queue the change: {}", e),
            ),
        }
    }

    fn report(&self, op_type: OperationType, target_id: &str, result: &SaveResult) {
        log::info!("[sync] {} {}: {}", op_type, target_id, result.status);
        self.notifier.notify(PortfolioEvent::SaveCompleted {
            op_type,
            target_id: target_id.to_string(),
            status: result.status,
            message: result.message.clone(),
        });
    }

    // Typed helpers

    /// Save an app's whole task list. Tasks without an id get one.
    pub async fn save_tasks(
        &self,
        app_id: &str,
        mut tasks: Vec<TaskRecord>,
    ) -> Result<SaveResult, AppError> {
        tasks.iter_mut().for_each(TaskRecord::ensure_id);
        let payload = serde_json::to_value(&tasks)?;
        self.try_save(OperationType::Tasks, app_id, payload).await
    }

    /// Append a review to an app's history.
    pub async fn add_review(&self, app_id: &str, review: ReviewRecord) -> Result<SaveResult, AppError> {
        let mut history = self.store.get_reviews(app_id).await?;
        history.push(review);
        let payload = serde_json::to_value(&history)?;
        self.try_save(OperationType::Reviews, app_id, payload).await
    }

    pub async fn save_idea(&self, idea: &IdeaRecord) -> Result<SaveResult, AppError> {
        let payload = serde_json::to_value(idea)?;
        self.try_save(OperationType::Ideas, &idea.id, payload).await
    }

    /// Add a task submitted through the public form.
    pub async fn submit_task(
        &self,
        app_id: &str,
        title: &str,
        submitter: &str,
    ) -> Result<SaveResult, AppError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(AppError::invalid_input_field("Task title must not be empty", "title"));
        }

        let mut tasks = self.store.get_tasks(app_id).await?;
        tasks.push(TaskRecord::submission(title, submitter.trim()));
        self.save_tasks(app_id, tasks).await
    }

    pub async fn transition_idea(&self, idea_id: &str, status: IdeaStatus) -> Result<SaveResult, AppError> {
        let mut idea = self.load_idea(idea_id).await?;
        idea.transition(status)?;
        self.save_idea(&idea).await
    }

    pub async fn comment_on_idea(
        &self,
        idea_id: &str,
        author: &str,
        body: &str,
    ) -> Result<SaveResult, AppError> {
        if author.trim().is_empty() {
            return Err(AppError::invalid_input_field("Author must not be empty", "author"));
        }
        if body.trim().is_empty() {
            return Err(AppError::invalid_input_field("Comment must not be empty", "body"));
        }

        let mut idea = self.load_idea(idea_id).await?;
        idea.add_comment(author.trim(), body.trim());
        self.save_idea(&idea).await
    }

    async fn load_idea(&self, idea_id: &str) -> Result<IdeaRecord, AppError> {
        if let Some(idea) = self.store.get_idea(idea_id).await? {
            return Ok(idea);
        }
        self.reconciler
            .ideas()
            .await
            .into_iter()
            .find(|idea| idea.id == idea_id)
            .ok_or_else(|| AppError::not_found_with_id("idea", idea_id))
    }
}

/// Delivers queued operations through the remote client.
pub struct RemoteDeliverer {
    remote: Arc<RemoteDataClient>,
}

impl RemoteDeliverer {
    pub fn new(remote: Arc<RemoteDataClient>) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl Deliverer for RemoteDeliverer {
    async fn deliver(&self, operation: &QueuedOperation) -> WriteOutcome {
        self.remote
            .write_operation(operation.op_type, &operation.target_id, &operation.payload)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::models::AppRecord;
    use crate::services::blob_store::{MemoryBlobStore, StaticSourceListing};
    use chrono::NaiveDate;
    use std::sync::Mutex;

    const TASKS: &str = "data/apps/demo-app/tasks.json";

    struct Fixture {
        blobs: Arc<MemoryBlobStore>,
        store: LocalStore,
        queue: Arc<OfflineQueue>,
        remote: Arc<RemoteDataClient>,
        statuses: Arc<Mutex<Vec<SaveStatus>>>,
        sync: SyncOrchestrator,
    }

    async fn fixture() -> Fixture {
        let config = Arc::new(PortfolioConfig::default());
        let blobs = Arc::new(MemoryBlobStore::new());
        let listing = Arc::new(StaticSourceListing::default());
        let store = LocalStore::in_memory();
        let notifier = Arc::new(StateNotifier::new());
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        notifier.subscribe(move |event| {
            if let PortfolioEvent::SaveCompleted { status, .. } = event {
                sink.lock().unwrap().push(*status);
            }
        });

        let remote = Arc::new(RemoteDataClient::new(blobs.clone(), listing, &config));
        let queue = Arc::new(
            OfflineQueue::load(store.clone(), QueueSettings::default())
                .await
                .unwrap(),
        );
        let reconciler = Arc::new(Reconciler::new(
            remote.clone(),
            store.clone(),
            notifier.clone(),
            config.clone(),
        ));
        let sync = SyncOrchestrator::new(
            remote.clone(),
            store.clone(),
            queue.clone(),
            reconciler,
            notifier,
            config,
        );

        Fixture {
            blobs,
            store,
            queue,
            remote,
            statuses,
            sync,
        }
    }

    fn titles(json: &str) -> Vec<String> {
        let tasks: Vec<TaskRecord> = serde_json::from_str(json).unwrap();
        tasks.into_iter().map(|t| t.title).collect()
    }

    #[tokio::test]
    async fn test_save_ok_writes_both_sides() {
        let f = fixture().await;
        let result = f
            .sync
            .save_tasks("demo-app", vec![TaskRecord::new("Ship it")])
            .await
            .unwrap();

        assert_eq!(result.status, SaveStatus::Ok);
        assert_eq!(titles(&f.blobs.content(TASKS).await.unwrap()), vec!["Ship it"]);
        assert_eq!(f.store.get_tasks("demo-app").await.unwrap().len(), 1);
        assert_eq!(*f.statuses.lock().unwrap(), vec![SaveStatus::Ok]);
    }

    #[tokio::test]
    async fn test_offline_save_is_queued_and_delivered_later() {
        let f = fixture().await;
        f.blobs.set_offline(true);

        let result = f
            .sync
            .save_tasks("demo-app", vec![TaskRecord::new("Offline edit")])
            .await
            .unwrap();
        assert_eq!(result.status, SaveStatus::Queued);
        assert_eq!(f.queue.len().await, 1);
        assert_eq!(f.store.get_tasks("demo-app").await.unwrap().len(), 1);

        f.blobs.set_offline(false);
        let deliverer = RemoteDeliverer::new(f.remote.clone());
        let report = f.queue.process_queue(&deliverer).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(f.queue.is_empty().await);
        assert_eq!(titles(&f.blobs.content(TASKS).await.unwrap()), vec!["Offline edit"]);
    }

    #[tokio::test]
    async fn test_save_behind_pending_write_is_coalesced() {
        let f = fixture().await;
        f.queue.set_online(false);
        f.sync
            .save_tasks("demo-app", vec![TaskRecord::new("first")])
            .await
            .unwrap();
        f.queue.set_online(true);

        let result = f
            .sync
            .save_tasks("demo-app", vec![TaskRecord::new("second")])
            .await
            .unwrap();
        assert_eq!(result.status, SaveStatus::Queued);
        assert_eq!(f.blobs.write_count(), 0);

        let pending = f.queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload[0]["title"], "second");
    }

    #[tokio::test]
    async fn test_conflict_keeps_remote_and_retry_reapplies() {
        let f = fixture().await;
        f.sync
            .save_tasks("demo-app", vec![TaskRecord::new("mine")])
            .await
            .unwrap();

        // Someone else rewrites the blob
        f.blobs
            .insert(TASKS, r#"[{"id": "theirs", "title": "theirs"}]"#)
            .await;

        let result = f
            .sync
            .save_tasks("demo-app", vec![TaskRecord::new("mine again")])
            .await
            .unwrap();
        assert_eq!(result.status, SaveStatus::Conflict);
        assert_eq!(titles(&f.blobs.content(TASKS).await.unwrap()), vec!["theirs"]);
        assert_eq!(f.store.get_tasks("demo-app").await.unwrap()[0].title, "mine again");

        let retried = f
            .sync
            .retry_after_conflict(OperationType::Tasks, "demo-app", |mut remote| {
                if let Value::Array(items) = &mut remote {
                    items.push(serde_json::json!({"id": "t-new", "title": "mine again"}));
                }
                remote
            })
            .await
            .unwrap();
        assert_eq!(retried.status, SaveStatus::Ok);
        assert_eq!(
            titles(&f.blobs.content(TASKS).await.unwrap()),
            vec!["theirs", "mine again"]
        );
    }

    #[tokio::test]
    async fn test_second_conflict_is_reported() {
        let f = fixture().await;
        f.blobs.insert(TASKS, "[]").await;

        let blobs = f.blobs.clone();
        let result = f
            .sync
            .retry_after_conflict(OperationType::Tasks, "demo-app", move |remote| {
                // Changes again between our read and our write
                futures::executor::block_on(blobs.insert(TASKS, r#"[{"id": "x", "title": "x"}]"#));
                remote
            })
            .await
            .unwrap();
        assert_eq!(result.status, SaveStatus::Conflict);
    }

    #[tokio::test]
    async fn test_refused_write_is_failed() {
        let f = fixture().await;
        f.remote.fetch_tasks("demo-app", false).await.unwrap();
        f.blobs
            .inject_failure(AppError::authentication("Bad credentials"))
            .await;

        let result = f
            .sync
            .save_tasks("demo-app", vec![TaskRecord::new("x")])
            .await
            .unwrap();
        assert_eq!(result.status, SaveStatus::Failed);
        assert!(f.queue.is_empty().await);
        assert_eq!(f.store.get_tasks("demo-app").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_programmer_errors_are_rejected() {
        let f = fixture().await;
        assert!(f
            .sync
            .try_save(OperationType::Tasks, " ", serde_json::json!([]))
            .await
            .is_err());
        assert!(f
            .sync
            .try_save(OperationType::Tasks, "demo-app", serde_json::json!({"title": "x"}))
            .await
            .is_err());

        let idea = IdeaRecord::new("Idea", None);
        let err = f
            .sync
            .try_save(OperationType::Ideas, "other-id", serde_json::to_value(&idea).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput { .. }));
        assert!(f.statuses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_review_updates_dates() {
        let f = fixture().await;
        f.store.put_app(&AppRecord::new("demo-app")).await.unwrap();

        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let result = f
            .sync
            .add_review("demo-app", ReviewRecord::new(date))
            .await
            .unwrap();
        assert!(result.is_ok());

        let app = f.store.get_app("demo-app").await.unwrap().unwrap();
        assert_eq!(app.last_review_date, Some(date));
        assert_eq!(app.next_review_date, NaiveDate::from_ymd_opt(2024, 3, 31));
        assert_eq!(f.store.get_reviews("demo-app").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_task_marks_submission() {
        let f = fixture().await;
        assert!(f.sync.submit_task("demo-app", "  ", "ana").await.is_err());

        f.sync.submit_task("demo-app", "Dark mode", "ana").await.unwrap();
        let tasks = f.store.get_tasks("demo-app").await.unwrap();
        assert_eq!(tasks[0].source.as_deref(), Some(TaskRecord::PUBLIC_SUBMISSION));
        assert_eq!(tasks[0].submitter.as_deref(), Some("ana"));
    }

    #[tokio::test]
    async fn test_idea_lifecycle() {
        let f = fixture().await;
        let idea = IdeaRecord::new("Widget", Some("ana".to_string()));
        f.sync.save_idea(&idea).await.unwrap();

        f.sync
            .transition_idea(&idea.id, IdeaStatus::InDevelopment)
            .await
            .unwrap();
        f.sync.comment_on_idea(&idea.id, "bo", "Nice").await.unwrap();

        let path = format!("data/ideas/{}.yml", idea.id);
        let remote: IdeaRecord = serde_yaml::from_str(&f.blobs.content(&path).await.unwrap()).unwrap();
        assert_eq!(remote.status, IdeaStatus::InDevelopment);
        assert_eq!(remote.comments.len(), 1);

        assert!(f
            .sync
            .transition_idea(&idea.id, IdeaStatus::Pending)
            .await
            .is_err());
        assert!(f.sync.transition_idea("missing", IdeaStatus::Rejected).await.is_err());
    }
}
