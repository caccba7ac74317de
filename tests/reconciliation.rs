//! Reconciliation tests.
//!
//! These tests drive a full `PortfolioContext` over the in-memory blob store
//! and check how local and remote copies are brought in line:
//! 1. Fallback - a failed remote load returns exactly the local cache
//! 2. Merge - remote wins, tasks follow remote deletions, ideas do not
//! 3. Idempotence - a second identical refresh changes nothing and is silent
//! 4. Conflicts - a stale write never overwrites the remote

use portfolio_sync::models::{AppRecord, IdeaRecord, OperationType, TaskRecord};
use portfolio_sync::services::{
    LoadSource, MemoryBlobStore, PortfolioEvent, SaveStatus, StaticSourceListing, WriteOutcome,
};
use portfolio_sync::{PortfolioConfig, PortfolioContext};
use std::sync::{Arc, Mutex};

const DEMO_TASKS: &str = "data/apps/demo-app/tasks.json";

struct Harness {
    blobs: Arc<MemoryBlobStore>,
    ctx: PortfolioContext,
    events: Arc<Mutex<Vec<PortfolioEvent>>>,
}

async fn harness() -> Harness {
    let blobs = Arc::new(MemoryBlobStore::new());
    let listing = Arc::new(StaticSourceListing::default());
    let ctx = PortfolioContext::new(PortfolioConfig::default(), blobs.clone(), listing)
        .await
        .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    ctx.notifier
        .subscribe(move |event| sink.lock().unwrap().push(event.clone()));

    Harness { blobs, ctx, events }
}

fn task(id: &str, title: &str, completed: bool) -> TaskRecord {
    let mut task = TaskRecord::new(title);
    task.id = Some(id.to_string());
    task.completed = completed;
    task.created_at = None;
    task
}

fn task_updates(events: &Mutex<Vec<PortfolioEvent>>) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, PortfolioEvent::TasksUpdated { .. }))
        .count()
}

#[tokio::test]
async fn test_failed_remote_load_returns_local_cache() {
    let h = harness().await;

    let mut alpha = AppRecord::new("alpha");
    alpha.tasks = vec![task("t1", "Keep me", false)];
    let beta = AppRecord::new("beta");
    h.ctx.store.put_apps(&[alpha, beta]).await.unwrap();
    let before = h.ctx.store.get_all_apps().await.unwrap();

    h.blobs.set_offline(true);
    let report = h.ctx.reconciler.load_portfolio().await.unwrap();

    assert_eq!(report.source, LoadSource::Local);
    assert_eq!(report.apps, before);
    assert_eq!(h.ctx.reconciler.apps().await, before);
    assert_eq!(h.ctx.store.get_all_apps().await.unwrap(), before);
}

#[tokio::test]
async fn test_malformed_overview_serves_local_cache_as_stored() {
    let h = harness().await;

    let mut alpha = AppRecord::new("alpha");
    alpha.tasks = vec![task("t1", "Keep me", false)];
    h.ctx.store.put_apps(&[alpha]).await.unwrap();
    let before = h.ctx.store.get_all_apps().await.unwrap();

    h.blobs.insert("data/overview.json", "{not json").await;
    h.blobs
        .insert(
            "data/apps/alpha/tasks.json",
            serde_json::to_string(&vec![task("t9", "Remote only", true)]).unwrap(),
        )
        .await;

    let report = h.ctx.reconciler.load_portfolio().await.unwrap();

    assert_eq!(report.source, LoadSource::Local);
    assert_eq!(report.apps, before);
    assert_eq!(h.ctx.store.get_all_apps().await.unwrap(), before);
    assert_eq!(task_updates(&h.events), 0);
}

#[tokio::test]
async fn test_demo_app_scenario() {
    let h = harness().await;
    h.ctx
        .store
        .put_tasks("demo-app", &[task("t1", "first", false)])
        .await
        .unwrap();
    h.blobs
        .insert(
            DEMO_TASKS,
            r#"[{"id":"t1","completed":true},{"id":"t2","title":"new"}]"#,
        )
        .await;

    let merged = h.ctx.reconciler.refresh_tasks("demo-app").await.unwrap();

    let summary: Vec<(Option<&str>, &str, bool)> = merged
        .iter()
        .map(|t| (t.id.as_deref(), t.title.as_str(), t.completed))
        .collect();
    assert_eq!(summary, vec![(Some("t1"), "", true), (Some("t2"), "new", false)]);
    assert_eq!(h.ctx.store.get_tasks("demo-app").await.unwrap(), merged);
}

#[tokio::test]
async fn test_identical_refresh_is_silent() {
    let h = harness().await;
    h.blobs
        .insert(
            DEMO_TASKS,
            serde_json::to_string(&vec![task("t1", "only", false)]).unwrap(),
        )
        .await;

    h.ctx.reconciler.refresh_tasks("demo-app").await.unwrap();
    assert_eq!(task_updates(&h.events), 1);

    let again = h.ctx.reconciler.refresh_tasks("demo-app").await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(task_updates(&h.events), 1);
}

#[tokio::test]
async fn test_deletions_propagate_for_tasks_only() {
    let h = harness().await;

    h.ctx
        .store
        .put_tasks(
            "demo-app",
            &[task("t1", "stays", false), task("t-gone", "deleted remotely", false)],
        )
        .await
        .unwrap();
    h.blobs
        .insert(
            DEMO_TASKS,
            serde_json::to_string(&vec![task("t1", "stays", false)]).unwrap(),
        )
        .await;

    let tasks = h.ctx.reconciler.refresh_tasks("demo-app").await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id.as_deref(), Some("t1"));

    let local_idea = IdeaRecord::new("Only here", None);
    h.ctx.store.put_idea(&local_idea).await.unwrap();
    let remote_idea = IdeaRecord::new("Only there", None);
    h.blobs
        .insert(
            &format!("data/ideas/{}.yml", remote_idea.id),
            serde_yaml::to_string(&remote_idea).unwrap(),
        )
        .await;

    let ideas = h.ctx.reconciler.refresh_ideas().await.unwrap();
    assert_eq!(ideas.len(), 2);
    assert!(ideas.iter().any(|i| i.id == local_idea.id));
}

#[tokio::test]
async fn test_empty_remote_tasks_do_not_wipe_local() {
    let h = harness().await;
    h.ctx
        .store
        .put_tasks("demo-app", &[task("t1", "local", false)])
        .await
        .unwrap();
    h.blobs.insert(DEMO_TASKS, "[]").await;

    let tasks = h.ctx.reconciler.refresh_tasks("demo-app").await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(task_updates(&h.events), 0);
}

#[tokio::test]
async fn test_stale_token_write_conflicts_without_clobbering() {
    let h = harness().await;
    h.blobs
        .insert(
            DEMO_TASKS,
            serde_json::to_string(&vec![task("t1", "original", false)]).unwrap(),
        )
        .await;
    h.ctx.remote.fetch_tasks("demo-app", false).await.unwrap();

    // Another writer updates the blob after our read
    let theirs = serde_json::to_string(&vec![task("t1", "theirs", true)]).unwrap();
    h.blobs.insert(DEMO_TASKS, theirs.clone()).await;

    let outcome = h
        .ctx
        .remote
        .write_tasks("demo-app", &[task("t1", "ours", false)])
        .await;
    assert_eq!(outcome, WriteOutcome::Conflict);
    assert_eq!(h.blobs.content(DEMO_TASKS).await.unwrap(), theirs);

    let fresh = h.ctx.remote.fetch_tasks("demo-app", true).await.unwrap();
    assert_eq!(fresh, vec![task("t1", "theirs", true)]);
}

#[tokio::test]
async fn test_conflicting_save_reports_conflict_and_is_not_queued() {
    let h = harness().await;
    h.ctx
        .sync
        .save_tasks("demo-app", vec![task("t1", "ours", false)])
        .await
        .unwrap();
    h.blobs.insert(DEMO_TASKS, "[]").await;

    let result = h
        .ctx
        .sync
        .try_save(
            OperationType::Tasks,
            "demo-app",
            serde_json::to_value(vec![task("t1", "ours, edited", false)]).unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, SaveStatus::Conflict);
    assert_eq!(h.blobs.content(DEMO_TASKS).await.unwrap(), "[]");
    assert!(h.ctx.queue.is_empty().await);
    assert_eq!(
        h.ctx.store.get_tasks("demo-app").await.unwrap()[0].title,
        "ours, edited"
    );
}

#[tokio::test]
async fn test_enumeration_fallback_then_remote_overview() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let listing = Arc::new(StaticSourceListing::default());
    listing
        .set_repositories(vec![serde_json::from_value(serde_json::json!({
            "name": "demo-app",
            "url": "https://github.com/me/demo-app",
            "stars": 2
        }))
        .unwrap()])
        .await;
    let ctx = PortfolioContext::new(PortfolioConfig::default(), blobs.clone(), listing)
        .await
        .unwrap();

    let report = ctx.reconciler.load_portfolio().await.unwrap();
    assert_eq!(report.source, LoadSource::Enumerated);
    assert_eq!(report.apps[0].star_count, 2);

    blobs
        .insert(
            "data/overview.json",
            r#"{"apps": [{"id": "demo-app", "name": "demo-app", "notes": "curated"}]}"#,
        )
        .await;
    ctx.remote.clear_cache().await;
    let report = ctx.reconciler.load_portfolio().await.unwrap();
    assert_eq!(report.source, LoadSource::Remote);
    assert_eq!(report.apps[0].notes.as_deref(), Some("curated"));
}
