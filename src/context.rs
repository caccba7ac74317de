//! Wiring of the sync services into one shared context.

use crate::config::PortfolioConfig;
use crate::error::AppError;
use crate::services::blob_store::{BlobStore, SourceListing};
use crate::services::github_client::GitHubClient;
use crate::services::local_store::LocalStore;
use crate::services::offline_queue::{Deliverer, OfflineQueue, QueueHandle, QueueWorker};
use crate::services::reconciler::Reconciler;
use crate::services::remote_data::RemoteDataClient;
use crate::services::sync_events::StateNotifier;
use crate::services::sync_orchestrator::{RemoteDeliverer, SyncOrchestrator};
use std::sync::Arc;

/// Every service of the data layer, built once and shared.
pub struct PortfolioContext {
    pub config: Arc<PortfolioConfig>,
    pub store: LocalStore,
    pub remote: Arc<RemoteDataClient>,
    pub queue: Arc<OfflineQueue>,
    pub notifier: Arc<StateNotifier>,
    pub reconciler: Arc<Reconciler>,
    pub sync: Arc<SyncOrchestrator>,
}

impl PortfolioContext {
    /// Build the context over the given remote backends.
    ///
    /// The local store opens `config.db_path`, falling back to memory if the
    /// database cannot be opened; pending queue entries are restored from it.
    pub async fn new(
        config: PortfolioConfig,
        blob_store: Arc<dyn BlobStore>,
        listing: Arc<dyn SourceListing>,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let config = Arc::new(config);

        let store = LocalStore::open(config.db_path.as_deref()).await;
        let remote = Arc::new(RemoteDataClient::new(blob_store, listing, &config));
        let queue = Arc::new(OfflineQueue::load(store.clone(), config.queue.clone()).await?);
        let notifier = Arc::new(StateNotifier::new());
        let reconciler = Arc::new(Reconciler::new(
            remote.clone(),
            store.clone(),
            notifier.clone(),
            config.clone(),
        ));
        let sync = Arc::new(SyncOrchestrator::new(
            remote.clone(),
            store.clone(),
            queue.clone(),
            reconciler.clone(),
            notifier.clone(),
            config.clone(),
        ));

        log::info!(
            "[context] Ready ({} local store, {} pending writes)",
            if store.is_durable() { "durable" } else { "in-memory" },
            queue.len().await
        );

        Ok(Self {
            config,
            store,
            remote,
            queue,
            notifier,
            reconciler,
            sync,
        })
    }

    /// Build the context against the GitHub API.
    pub async fn from_config(config: PortfolioConfig) -> Result<Self, AppError> {
        let client = Arc::new(GitHubClient::new(config.github_client_config())?);
        Self::new(config, client.clone(), client).await
    }

    pub fn deliverer(&self) -> Arc<dyn Deliverer> {
        Arc::new(RemoteDeliverer::new(self.remote.clone()))
    }

    /// Start draining the offline queue in the background.
    pub fn start_queue_worker(&self) -> QueueHandle {
        QueueWorker::start(self.queue.clone(), self.deliverer())
    }
}
