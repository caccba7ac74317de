//! Business logic services.
//!
//! This module contains the remote and local storage layers, reconciliation
//! between them, and the offline write queue.
//!
//! Remote access goes through the `BlobStore`/`SourceListing` traits so every
//! service can be tested against the in-memory implementations.

pub mod blob_store;
pub mod codec;
pub mod credentials;
pub mod github_client;
pub mod local_store;
pub mod merge;
pub mod offline_queue;
pub mod reconciler;
pub mod remote_data;
pub mod sync_events;
pub mod sync_orchestrator;

pub use blob_store::{Blob, BlobStore, MemoryBlobStore, SourceListing, StaticSourceListing};
pub use credentials::CredentialService;
pub use github_client::{GitHubClient, GitHubClientConfig};
pub use local_store::LocalStore;
pub use offline_queue::{Deliverer, DrainReport, OfflineQueue, QueueHandle, QueueWorker};
pub use reconciler::{LoadReport, Reconciler, ViewTicket};
pub use remote_data::{RemoteDataClient, WriteOutcome};
pub use sync_events::{LoadSource, PortfolioEvent, QueueEvent, SaveStatus, StateNotifier};
pub use sync_orchestrator::{RemoteDeliverer, SaveResult, SyncOrchestrator};
