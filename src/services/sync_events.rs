//! Events emitted by the sync layer.
//!
//! `PortfolioEvent`s go to UI subscribers through the `StateNotifier`;
//! `QueueEvent`s are broadcast by the offline queue.

use crate::models::OperationType;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Where a portfolio load got its data from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    /// The remote overview manifest.
    Remote,
    /// The local cache (remote unavailable or empty).
    Local,
    /// A fresh enumeration of the owner's repositories.
    Enumerated,
    /// Nothing available anywhere.
    Empty,
}

/// Status of a save as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveStatus {
    /// Saved locally and remotely.
    Ok,
    /// Saved locally; the remote write will be retried.
    Queued,
    /// Saved locally; the remote changed meanwhile and was not overwritten.
    Conflict,
    /// Saved locally; the remote write was refused.
    Failed,
}

impl std::fmt::Display for SaveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Queued => write!(f, "queued"),
            Self::Conflict => write!(f, "conflict"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// State change visible to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PortfolioEvent {
    PortfolioLoaded {
        source: LoadSource,
        app_count: usize,
    },
    TasksUpdated {
        app_id: String,
        task_count: usize,
    },
    ReviewsUpdated {
        app_id: String,
    },
    IdeasUpdated {
        idea_count: usize,
    },
    SaveCompleted {
        op_type: OperationType,
        target_id: String,
        status: SaveStatus,
        message: String,
    },
}

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued {
        id: String,
        op_type: OperationType,
        target_id: String,
        /// The payload replaced one already waiting for the same target.
        coalesced: bool,
    },
    Retrying {
        id: String,
        op_type: OperationType,
        target_id: String,
        retries: u32,
        delay_secs: u64,
        error: String,
    },
    Delivered {
        id: String,
        op_type: OperationType,
        target_id: String,
    },
    /// Gave up after the maximum number of retries.
    Abandoned {
        id: String,
        op_type: OperationType,
        target_id: String,
        retries: u32,
        error: String,
    },
    /// The remote changed since the payload was built.
    Conflict {
        id: String,
        op_type: OperationType,
        target_id: String,
    },
    /// Permanent failure.
    Failed {
        id: String,
        op_type: OperationType,
        target_id: String,
        error: String,
    },
    Discarded {
        id: String,
    },
}

type Listener = Arc<dyn Fn(&PortfolioEvent) + Send + Sync>;

/// Handle returned by `StateNotifier::subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Publish/subscribe for `PortfolioEvent`s.
///
/// A listener may call `notify` itself. Such nested notifications are not
/// delivered recursively: they are queued, identical pending events are
/// collapsed into one, and the queue is drained once the current round of
/// listeners has returned.
#[derive(Default)]
pub struct StateNotifier {
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_id: AtomicU64,
    notifying: AtomicBool,
    pending: Mutex<VecDeque<PortfolioEvent>>,
}

impl std::fmt::Debug for StateNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateNotifier")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Clears the notifying flag when a delivery round ends, even by unwinding.
struct NotifyGuard<'a>(&'a AtomicBool);

impl Drop for NotifyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Listener state stays consistent even if a listener panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StateNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&PortfolioEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.listeners).push((id, Arc::new(listener)));
        id
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn notify(&self, event: PortfolioEvent) {
        {
            let mut pending = lock(&self.pending);
            if !pending.contains(&event) {
                pending.push_back(event);
            }
        }

        loop {
            if self
                .notifying
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                // The running round picks it up
                return;
            }
            let guard = NotifyGuard(&self.notifying);

            loop {
                let next = lock(&self.pending).pop_front();
                let Some(event) = next else { break };

                let listeners: Vec<Listener> = lock(&self.listeners)
                    .iter()
                    .map(|(_, listener)| listener.clone())
                    .collect();
                for listener in &listeners {
                    listener(&event);
                }
            }

            drop(guard);
            if lock(&self.pending).is_empty() {
                return;
            }
        }
    }
}
