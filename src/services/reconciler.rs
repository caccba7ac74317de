//! Portfolio loading and reconciliation.
//!
//! Loading walks a fallback chain: the remote overview, then the local
//! cache, then a live enumeration of the owner's repositories. A step that
//! fails or returns nothing never aborts the load; the next step runs.
//! Whatever the chosen source, private and excluded apps are filtered out
//! and removed from the local cache.
//!
//! Per-app tasks are then merged with their remote blob (remote is
//! authoritative and may delete), and review dates are hydrated from each
//! app's review history.

use crate::config::PortfolioConfig;
use crate::error::AppError;
use crate::models::review::latest_review_date;
use crate::models::{AppRecord, IdeaRecord, ReviewRecord, TaskRecord};
use crate::services::local_store::LocalStore;
use crate::services::merge::{merge_collections, merge_ideas, MergeMode};
use crate::services::remote_data::RemoteDataClient;
use crate::services::sync_events::{LoadSource, PortfolioEvent, StateNotifier};
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Result of `Reconciler::load_portfolio`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    pub source: LoadSource,
    pub apps: Vec<AppRecord>,
    /// Ids dropped by the private/excluded filter.
    pub removed: Vec<String>,
}

/// Identifies the view a request was made for.
///
/// Only the most recently begun view is current; results computed for an
/// older ticket are thrown away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewTicket {
    generation: u64,
    view: String,
}

impl ViewTicket {
    pub fn view(&self) -> &str {
        &self.view
    }
}

/// Decides which source is authoritative and keeps the local cache and the
/// in-memory snapshots in line with it.
pub struct Reconciler {
    remote: Arc<RemoteDataClient>,
    store: LocalStore,
    notifier: Arc<StateNotifier>,
    config: Arc<PortfolioConfig>,
    apps: RwLock<Vec<AppRecord>>,
    ideas: RwLock<Vec<IdeaRecord>>,
    view_generation: AtomicU64,
}

impl Reconciler {
    pub fn new(
        remote: Arc<RemoteDataClient>,
        store: LocalStore,
        notifier: Arc<StateNotifier>,
        config: Arc<PortfolioConfig>,
    ) -> Self {
        Self {
            remote,
            store,
            notifier,
            config,
            apps: RwLock::new(Vec::new()),
            ideas: RwLock::new(Vec::new()),
            view_generation: AtomicU64::new(0),
        }
    }

    /// Current app snapshot.
    pub async fn apps(&self) -> Vec<AppRecord> {
        self.apps.read().await.clone()
    }

    pub async fn app(&self, app_id: &str) -> Option<AppRecord> {
        self.apps.read().await.iter().find(|a| a.id == app_id).cloned()
    }

    /// Current idea snapshot.
    pub async fn ideas(&self) -> Vec<IdeaRecord> {
        self.ideas.read().await.clone()
    }

    fn is_visible(&self, app: &AppRecord) -> bool {
        (self.config.include_private || !app.is_private)
            && !self.config.is_excluded(&app.id)
            && !self.config.is_excluded(&app.name)
    }

    /// Drop hidden apps, deleting them from the local cache.
    async fn filter_visible(&self, apps: Vec<AppRecord>) -> (Vec<AppRecord>, Vec<String>) {
        let (kept, hidden): (Vec<_>, Vec<_>) = apps.into_iter().partition(|a| self.is_visible(a));

        let mut removed = Vec::with_capacity(hidden.len());
        for app in hidden {
            if let Err(e) = self.store.delete_app(&app.id).await {
                log::warn!("[reconcile] Failed to drop hidden app {}: {}", app.id, e);
            }
            removed.push(app.id);
        }
        if !removed.is_empty() {
            log::info!("[reconcile] Filtered out {} private/excluded apps", removed.len());
        }
        (kept, removed)
    }

    // Fallback chain

    async fn from_remote(&self) -> Option<Vec<AppRecord>> {
        match self.remote.fetch_overview().await {
            Ok(apps) if !apps.is_empty() => Some(apps),
            Ok(_) => {
                log::info!("[reconcile] Remote overview is empty");
                None
            }
            Err(e) if e.is_not_found() => {
                log::info!("[reconcile] No remote overview yet");
                None
            }
            Err(e) => {
                log::warn!("[reconcile] Remote overview unavailable: {}", e);
                None
            }
        }
    }

    async fn from_local(&self) -> Option<Vec<AppRecord>> {
        match self.store.get_all_apps().await {
            Ok(apps) if !apps.is_empty() => Some(apps),
            Ok(_) => None,
            Err(e) => {
                log::error!("[reconcile] Local cache unreadable: {}", e);
                None
            }
        }
    }

    async fn from_enumeration(&self) -> Option<Vec<AppRecord>> {
        match self.remote.enumerate_source().await {
            Ok(repos) if !repos.is_empty() => {
                Some(repos.iter().map(AppRecord::from_source).collect())
            }
            Ok(_) => {
                log::info!("[reconcile] Repository listing is empty");
                None
            }
            Err(e) => {
                log::warn!("[reconcile] Repository listing unavailable: {}", e);
                None
            }
        }
    }

    /// Remote records replace local ones, except that tasks stay local
    /// until hydration since the overview does not carry them.
    async fn persist_authoritative(&self, apps: &mut [AppRecord]) {
        for app in apps.iter_mut() {
            if app.tasks.is_empty() {
                if let Ok(Some(local)) = self.store.get_app(&app.id).await {
                    app.tasks = local.tasks;
                }
            }
            if let Err(e) = self.store.put_app(app).await {
                log::warn!("[reconcile] Failed to cache app {}: {}", app.id, e);
            }
        }
    }

    /// Load the portfolio through the fallback chain. Remote and enumerated
    /// results are persisted and hydrated; a local fallback is returned as stored.
    pub async fn load_portfolio(&self) -> Result<LoadReport, AppError> {
        let mut source = LoadSource::Empty;
        let mut removed = Vec::new();
        let mut apps = Vec::new();

        if let Some(remote) = self.from_remote().await {
            let (kept, dropped) = self.filter_visible(remote).await;
            removed.extend(dropped);
            if !kept.is_empty() {
                source = LoadSource::Remote;
                apps = kept;
            }
        }

        if source == LoadSource::Empty {
            if let Some(local) = self.from_local().await {
                let (kept, dropped) = self.filter_visible(local).await;
                removed.extend(dropped);
                if !kept.is_empty() {
                    source = LoadSource::Local;
                    apps = kept;
                }
            }
        }

        if source == LoadSource::Empty {
            if let Some(enumerated) = self.from_enumeration().await {
                let (kept, dropped) = self.filter_visible(enumerated).await;
                removed.extend(dropped);
                if !kept.is_empty() {
                    source = LoadSource::Enumerated;
                    apps = kept;
                }
            }
        }

        log::info!("[reconcile] Loaded {} apps from {:?}", apps.len(), source);

        // Local loads are returned as cached
        if matches!(source, LoadSource::Remote | LoadSource::Enumerated) {
            self.persist_authoritative(&mut apps).await;
            self.hydrate_tasks(&mut apps).await;
            self.hydrate_reviews(&mut apps).await;
        }

        *self.apps.write().await = apps.clone();
        self.notifier.notify(PortfolioEvent::PortfolioLoaded {
            source,
            app_count: apps.len(),
        });

        Ok(LoadReport {
            source,
            apps,
            removed,
        })
    }

    // Hydration

    /// Merge each app's remote task list, one app at a time.
    async fn hydrate_tasks(&self, apps: &mut [AppRecord]) {
        for app in apps.iter_mut() {
            match self.remote.fetch_tasks(&app.id, false).await {
                Ok(remote) => {
                    if let Some(merged) = self.apply_remote_tasks(&app.id, &app.tasks, &remote).await {
                        app.tasks = merged;
                    }
                }
                Err(e) => log::warn!("[reconcile] Keeping local tasks for {}: {}", app.id, e),
            }
        }
    }

    /// Derive review dates from each app's history. Apps are independent,
    /// so their histories are fetched concurrently.
    async fn hydrate_reviews(&self, apps: &mut [AppRecord]) {
        let fetches = apps.iter().map(|app| {
            let app_id = app.id.clone();
            async move {
                let reviews = match self.remote.fetch_reviews(&app_id, false).await {
                    Ok(remote) if !remote.is_empty() => {
                        if let Err(e) = self.store.put_reviews(&app_id, &remote).await {
                            log::warn!("[reconcile] Failed to cache reviews for {}: {}", app_id, e);
                        }
                        remote
                    }
                    Ok(_) => self.local_reviews(&app_id).await,
                    Err(e) => {
                        log::debug!("[reconcile] Remote reviews for {} unavailable: {}", app_id, e);
                        self.local_reviews(&app_id).await
                    }
                };
                (app_id, reviews)
            }
        });
        let results = join_all(fetches).await;

        let cycle = self.config.review_cycle_days;
        for (app, (app_id, reviews)) in apps.iter_mut().zip(results) {
            debug_assert_eq!(app.id, app_id);
            let before = (app.last_review_date, app.next_review_date);
            if let Some(latest) = latest_review_date(&reviews) {
                app.record_review(latest, cycle);
            } else {
                app.refresh_next_review(cycle);
            }

            if (app.last_review_date, app.next_review_date) != before {
                if let Err(e) = self.store.put_app(app).await {
                    log::warn!("[reconcile] Failed to cache review dates for {}: {}", app.id, e);
                }
                self.notifier.notify(PortfolioEvent::ReviewsUpdated {
                    app_id: app.id.clone(),
                });
            }
        }
    }

    async fn local_reviews(&self, app_id: &str) -> Vec<ReviewRecord> {
        self.store.get_reviews(app_id).await.unwrap_or_else(|e| {
            log::warn!("[reconcile] Local reviews for {} unreadable: {}", app_id, e);
            Vec::new()
        })
    }

    /// Merge remote tasks into local ones. Persists, updates the snapshot
    /// and notifies only on change; returns the merged list in that case.
    async fn apply_remote_tasks(
        &self,
        app_id: &str,
        local: &[TaskRecord],
        remote: &[TaskRecord],
    ) -> Option<Vec<TaskRecord>> {
        let result = merge_collections(local, remote, MergeMode::DeletionAware);
        if !result.changed {
            return None;
        }

        if let Err(e) = self.store.put_tasks(app_id, &result.merged).await {
            log::warn!("[reconcile] Failed to cache tasks for {}: {}", app_id, e);
        }
        if let Some(app) = self.apps.write().await.iter_mut().find(|a| a.id == app_id) {
            app.tasks = result.merged.clone();
        }
        log::debug!("[reconcile] Tasks for {} changed ({} now)", app_id, result.merged.len());
        self.notifier.notify(PortfolioEvent::TasksUpdated {
            app_id: app_id.to_string(),
            task_count: result.merged.len(),
        });
        Some(result.merged)
    }

    // Refresh

    /// Re-fetch an app's tasks from the remote, bypassing the cache.
    pub async fn refresh_tasks(&self, app_id: &str) -> Result<Vec<TaskRecord>, AppError> {
        let remote = self.remote.fetch_tasks(app_id, true).await?;
        let local = self.store.get_tasks(app_id).await?;
        Ok(self
            .apply_remote_tasks(app_id, &local, &remote)
            .await
            .unwrap_or(local))
    }

    /// Re-fetch all ideas and merge them with the local ones, keeping
    /// ideas that have not reached the remote yet.
    pub async fn refresh_ideas(&self) -> Result<Vec<IdeaRecord>, AppError> {
        let local = self.store.get_all_ideas().await?;

        let remote = match self.remote.fetch_ideas(true).await {
            Ok(remote) => remote,
            Err(e) => {
                // Still show what we have
                *self.ideas.write().await = local;
                return Err(e);
            }
        };

        let result = merge_ideas(&local, &remote);
        if result.changed {
            for idea in &result.merged {
                self.store.put_idea(idea).await?;
            }
            self.notifier.notify(PortfolioEvent::IdeasUpdated {
                idea_count: result.merged.len(),
            });
        }
        *self.ideas.write().await = result.merged.clone();
        Ok(result.merged)
    }

    // Stale-response guarding

    /// Start a new view. Every earlier ticket becomes stale.
    pub fn begin_view(&self, view: impl Into<String>) -> ViewTicket {
        let generation = self.view_generation.fetch_add(1, Ordering::SeqCst) + 1;
        ViewTicket {
            generation,
            view: view.into(),
        }
    }

    pub fn is_current(&self, ticket: &ViewTicket) -> bool {
        self.view_generation.load(Ordering::SeqCst) == ticket.generation
    }

    /// `refresh_tasks` for a view. Returns `None`, applying nothing, when
    /// the view was superseded while the fetch was in flight.
    pub async fn refresh_tasks_for_view(
        &self,
        ticket: &ViewTicket,
        app_id: &str,
    ) -> Result<Option<Vec<TaskRecord>>, AppError> {
        let remote = self.remote.fetch_tasks(app_id, true).await?;
        if !self.is_current(ticket) {
            log::debug!(
                "[reconcile] Discarding tasks for {} fetched for stale view {}",
                app_id,
                ticket.view
            );
            return Ok(None);
        }

        let local = self.store.get_tasks(app_id).await?;
        Ok(Some(
            self.apply_remote_tasks(app_id, &local, &remote)
                .await
                .unwrap_or(local),
        ))
    }

    // Snapshot updates from local mutations

    pub(crate) async fn set_app_snapshot(&self, app: &AppRecord) {
        let mut apps = self.apps.write().await;
        match apps.iter_mut().find(|a| a.id == app.id) {
            Some(existing) => *existing = app.clone(),
            None => apps.push(app.clone()),
        }
    }

    pub(crate) async fn set_idea_snapshot(&self, idea: &IdeaRecord) {
        let mut ideas = self.ideas.write().await;
        match ideas.iter_mut().find(|i| i.id == idea.id) {
            Some(existing) => *existing = idea.clone(),
            None => ideas.push(idea.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceRepository;
    use crate::services::blob_store::{MemoryBlobStore, StaticSourceListing};
    use chrono::NaiveDate;
    use std::sync::Mutex;

    struct Fixture {
        blobs: Arc<MemoryBlobStore>,
        listing: Arc<StaticSourceListing>,
        store: LocalStore,
        events: Arc<Mutex<Vec<PortfolioEvent>>>,
        reconciler: Reconciler,
    }

    fn fixture_with(config: PortfolioConfig) -> Fixture {
        let blobs = Arc::new(MemoryBlobStore::new());
        let listing = Arc::new(StaticSourceListing::default());
        let store = LocalStore::in_memory();
        let notifier = Arc::new(StateNotifier::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        notifier.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        let remote = Arc::new(RemoteDataClient::new(blobs.clone(), listing.clone(), &config));
        let reconciler = Reconciler::new(remote, store.clone(), notifier, Arc::new(config));
        Fixture {
            blobs,
            listing,
            store,
            events,
            reconciler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(PortfolioConfig::default())
    }

    fn repo(name: &str, private: bool) -> SourceRepository {
        SourceRepository {
            name: name.to_string(),
            url: format!("https://github.com/me/{}", name),
            description: None,
            updated_at: None,
            stars: 0,
            language: None,
            is_private: private,
            archived: false,
        }
    }

    #[tokio::test]
    async fn test_remote_overview_wins() {
        let f = fixture();
        f.blobs
            .insert("data/overview.json", r#"[{"id": "demo-app", "name": "demo-app"}]"#)
            .await;
        f.store.put_app(&AppRecord::new("stale-app")).await.unwrap();

        let report = f.reconciler.load_portfolio().await.unwrap();
        assert_eq!(report.source, LoadSource::Remote);
        assert_eq!(report.apps.len(), 1);
        assert!(f.store.get_app("demo-app").await.unwrap().is_some());
        assert_eq!(f.reconciler.apps().await.len(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_local_then_enumeration() {
        let f = fixture();
        f.blobs.set_offline(true);
        f.store.put_app(&AppRecord::new("cached")).await.unwrap();

        let report = f.reconciler.load_portfolio().await.unwrap();
        assert_eq!(report.source, LoadSource::Local);
        assert_eq!(report.apps[0].id, "cached");

        let f = fixture();
        f.blobs.insert("data/overview.json", "not json").await;
        f.listing.set_repositories(vec![repo("Fresh Repo", false)]).await;

        let report = f.reconciler.load_portfolio().await.unwrap();
        assert_eq!(report.source, LoadSource::Enumerated);
        assert_eq!(report.apps[0].id, "fresh-repo");
        assert!(f.store.get_app("fresh-repo").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_nothing_anywhere_is_empty() {
        let f = fixture();
        f.listing.set_offline(true);
        let report = f.reconciler.load_portfolio().await.unwrap();
        assert_eq!(report.source, LoadSource::Empty);
        assert!(report.apps.is_empty());
        assert!(matches!(
            f.events.lock().unwrap().last(),
            Some(PortfolioEvent::PortfolioLoaded { source: LoadSource::Empty, .. })
        ));
    }

    #[tokio::test]
    async fn test_private_and_excluded_are_filtered_and_deleted() {
        let mut config = PortfolioConfig::default();
        config.excluded_repos = vec!["Dotfiles".to_string()];
        let f = fixture_with(config);

        let mut private = AppRecord::new("secret");
        private.is_private = true;
        f.store.put_app(&private).await.unwrap();
        f.store.put_app(&AppRecord::new("dotfiles")).await.unwrap();
        f.store.put_app(&AppRecord::new("public-app")).await.unwrap();
        f.blobs.set_offline(true);

        let report = f.reconciler.load_portfolio().await.unwrap();
        assert_eq!(report.source, LoadSource::Local);
        assert_eq!(report.apps.len(), 1);
        assert_eq!(report.removed.len(), 2);
        assert!(f.store.get_app("secret").await.unwrap().is_none());
        assert!(f.store.get_app("dotfiles").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_all_remote_apps_hidden_falls_through() {
        let f = fixture();
        f.blobs
            .insert("data/overview.json", r#"[{"id": "secret", "isPrivate": true}]"#)
            .await;
        f.store.put_app(&AppRecord::new("cached")).await.unwrap();

        let report = f.reconciler.load_portfolio().await.unwrap();
        assert_eq!(report.source, LoadSource::Local);
        assert_eq!(report.removed, vec!["secret".to_string()]);
    }

    #[tokio::test]
    async fn test_hydration_merges_tasks_and_review_dates() {
        let f = fixture();
        f.blobs.insert("data/overview.json", r#"[{"id": "demo-app"}]"#).await;
        f.blobs
            .insert(
                "data/apps/demo-app/tasks.json",
                r#"[{"id": "t1", "title": "One", "completed": true}]"#,
            )
            .await;
        f.blobs
            .insert(
                "data/apps/demo-app/reviews.json",
                r#"[{"id": "r1", "reviewedAt": "2024-01-10"}, {"id": "r2", "reviewedAt": "2024-03-01"}]"#,
            )
            .await;

        let report = f.reconciler.load_portfolio().await.unwrap();
        let app = &report.apps[0];
        assert_eq!(app.tasks.len(), 1);
        assert!(app.tasks[0].completed);
        assert_eq!(app.last_review_date, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(app.next_review_date, NaiveDate::from_ymd_opt(2024, 5, 30));
        assert_eq!(f.store.get_reviews("demo-app").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_tasks_notifies_only_on_change() {
        let f = fixture();
        f.blobs
            .insert("data/apps/demo-app/tasks.json", r#"[{"id": "t1", "title": "One"}]"#)
            .await;

        let tasks = f.reconciler.refresh_tasks("demo-app").await.unwrap();
        assert_eq!(tasks.len(), 1);
        f.reconciler.refresh_tasks("demo-app").await.unwrap();

        let updates = f
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, PortfolioEvent::TasksUpdated { .. }))
            .count();
        assert_eq!(updates, 1);
    }

    #[tokio::test]
    async fn test_refresh_ideas_keeps_local_only() {
        let f = fixture();
        let local_only = IdeaRecord::new("Not pushed yet", None);
        f.store.put_idea(&local_only).await.unwrap();
        f.blobs
            .insert("data/ideas/remote-1.yml", "id: remote-1\ntitle: From remote\n")
            .await;

        let ideas = f.reconciler.refresh_ideas().await.unwrap();
        assert_eq!(ideas.len(), 2);
        assert_eq!(f.reconciler.ideas().await.len(), 2);
        assert!(f.store.get_idea(&local_only.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_view_results_are_discarded() {
        let f = fixture();
        f.blobs
            .insert("data/apps/demo-app/tasks.json", r#"[{"id": "t1", "title": "One"}]"#)
            .await;

        let old = f.reconciler.begin_view("app:demo-app");
        let current = f.reconciler.begin_view("app:other");
        assert!(!f.reconciler.is_current(&old));

        let result = f.reconciler.refresh_tasks_for_view(&old, "demo-app").await.unwrap();
        assert!(result.is_none());
        assert!(f.store.get_tasks("demo-app").await.unwrap().is_empty());

        let result = f
            .reconciler
            .refresh_tasks_for_view(&current, "demo-app")
            .await
            .unwrap();
        assert_eq!(result.unwrap().len(), 1);
    }
}
