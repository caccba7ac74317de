//! Durable queue of remote writes that could not complete.
//!
//! The queue is kept in memory and mirrored to the local store after every
//! change, so pending writes (and their retry counts) survive a restart.
//! Writes for the same `(type, target)` are coalesced at enqueue time: the
//! entry keeps its place in line and takes the newest payload.
//!
//! `QueueWorker` drains the queue in the background on a timer that follows
//! the backoff schedule, and on demand.

use crate::config::QueueSettings;
use crate::error::AppError;
use crate::models::{OperationType, QueueStatus, QueuedOperation};
use crate::services::local_store::LocalStore;
use crate::services::remote_data::WriteOutcome;
use crate::services::sync_events::QueueEvent;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

/// Capacity of the queue event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Worker wake-up interval when nothing is scheduled.
const IDLE_POLL: Duration = Duration::from_secs(60);

/// Lower bound between two worker drains.
const MIN_DRAIN_INTERVAL: Duration = Duration::from_millis(200);

/// Performs the remote write for a queued operation.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, operation: &QueuedOperation) -> WriteOutcome;
}

/// Summary of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Another drain was running or the queue is offline.
    pub skipped: bool,
    pub attempted: usize,
    pub delivered: usize,
    pub retrying: usize,
    pub abandoned: usize,
    pub conflicts: usize,
    pub failed: usize,
    /// Operations left in the queue afterwards.
    pub remaining: usize,
}

impl DrainReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// Number of pending operations by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub retrying: usize,
}

/// Resets the drain flag however the drain ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Durable FIFO of deferred writes.
pub struct OfflineQueue {
    store: LocalStore,
    settings: QueueSettings,
    operations: Mutex<Vec<QueuedOperation>>,
    draining: AtomicBool,
    online: AtomicBool,
    events: broadcast::Sender<QueueEvent>,
}

impl OfflineQueue {
    /// Restore the queue persisted in `store`.
    ///
    /// An unreadable queue document is logged and replaced by an empty queue.
    pub async fn load(store: LocalStore, settings: QueueSettings) -> Result<Self, AppError> {
        let operations = match store.load_queue().await {
            Ok(operations) => operations,
            Err(e @ AppError::Malformed { .. }) => {
                log::error!("[queue] Discarding unreadable queue document: {}", e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        if !operations.is_empty() {
            log::info!("[queue] Restored {} pending operations", operations.len());
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            store,
            settings,
            operations: Mutex::new(operations),
            draining: AtomicBool::new(false),
            online: AtomicBool::new(true),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    async fn persist(&self, operations: &[QueuedOperation]) -> Result<(), AppError> {
        self.store.save_queue(operations).await.map_err(|e| {
            log::error!("[queue] Failed to persist queue: {}", e);
            e
        })
    }

    /// Add a write, coalescing with a pending write for the same target.
    pub async fn enqueue(
        &self,
        op_type: OperationType,
        target_id: &str,
        payload: serde_json::Value,
    ) -> Result<QueuedOperation, AppError> {
        if target_id.trim().is_empty() {
            return Err(AppError::invalid_input_field(
                "Target id must not be empty",
                "target_id",
            ));
        }

        let mut operations = self.operations.lock().await;
        let mut updated = operations.clone();
        let existing = updated
            .iter_mut()
            .find(|op| op.coalesce_key() == (op_type, target_id));

        let (operation, coalesced) = match existing {
            Some(op) => {
                op.payload = payload;
                op.retries = 0;
                op.last_error = None;
                op.next_attempt_at = None;
                op.status = QueueStatus::Queued;
                (op.clone(), true)
            }
            None => {
                let op = QueuedOperation::new(op_type, target_id, payload);
                updated.push(op.clone());
                (op, false)
            }
        };

        // Only commit what reached the store
        self.persist(&updated).await?;
        *operations = updated;
        drop(operations);

        log::info!(
            "[queue] {} {} for {}",
            if coalesced { "Coalesced" } else { "Queued" },
            op_type,
            target_id
        );
        self.emit(QueueEvent::Enqueued {
            id: operation.id.clone(),
            op_type,
            target_id: target_id.to_string(),
            coalesced,
        });
        Ok(operation)
    }

    /// Attempt every due operation once, in FIFO order.
    pub async fn process_queue(&self, deliverer: &dyn Deliverer) -> Result<DrainReport, AppError> {
        if !self.is_online() {
            return Ok(DrainReport::skipped());
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("[queue] Drain already running");
            return Ok(DrainReport::skipped());
        }
        let _guard = DrainGuard(&self.draining);

        let now = Utc::now();
        let due: Vec<QueuedOperation> = self
            .operations
            .lock()
            .await
            .iter()
            .filter(|op| op.is_due(now))
            .cloned()
            .collect();

        let mut report = DrainReport::default();

        for op in due {
            if !self.is_online() {
                log::info!("[queue] Went offline, pausing drain");
                break;
            }

            report.attempted += 1;
            let outcome = deliverer.deliver(&op).await;

            let mut operations = self.operations.lock().await;
            let Some(idx) = operations.iter().position(|o| o.id == op.id) else {
                // Discarded while in flight
                continue;
            };
            if operations[idx].payload != op.payload {
                log::debug!("[queue] {} superseded while in flight", op.id);
                continue;
            }

            match outcome {
                WriteOutcome::Ok => {
                    operations.remove(idx);
                    report.delivered += 1;
                    log::info!("[queue] Delivered {} for {}", op.op_type, op.target_id);
                    self.emit(QueueEvent::Delivered {
                        id: op.id.clone(),
                        op_type: op.op_type,
                        target_id: op.target_id.clone(),
                    });
                }
                WriteOutcome::Queued { reason } => {
                    let entry = &mut operations[idx];
                    entry.retries += 1;
                    entry.last_error = Some(reason.clone());

                    if entry.can_retry(self.settings.max_retries) {
                        let delay = self.settings.backoff_for(entry.retries);
                        entry.status = QueueStatus::Retrying;
                        entry.next_attempt_at = chrono::Duration::from_std(delay)
                            .ok()
                            .map(|d| Utc::now() + d);
                        report.retrying += 1;
                        log::warn!(
                            "[queue] {} for {} failed (attempt {}), retrying in {}s: {}",
                            op.op_type,
                            op.target_id,
                            entry.retries,
                            delay.as_secs(),
                            reason
                        );
                        self.emit(QueueEvent::Retrying {
                            id: op.id.clone(),
                            op_type: op.op_type,
                            target_id: op.target_id.clone(),
                            retries: entry.retries,
                            delay_secs: delay.as_secs(),
                            error: reason,
                        });
                    } else {
                        let retries = entry.retries;
                        operations.remove(idx);
                        report.abandoned += 1;
                        log::error!(
                            "[queue] Abandoning {} for {} after {} attempts: {}",
                            op.op_type,
                            op.target_id,
                            retries,
                            reason
                        );
                        self.emit(QueueEvent::Abandoned {
                            id: op.id.clone(),
                            op_type: op.op_type,
                            target_id: op.target_id.clone(),
                            retries,
                            error: reason,
                        });
                    }
                }
                WriteOutcome::Conflict => {
                    operations.remove(idx);
                    report.conflicts += 1;
                    log::warn!("[queue] Conflict delivering {} for {}", op.op_type, op.target_id);
                    self.emit(QueueEvent::Conflict {
                        id: op.id.clone(),
                        op_type: op.op_type,
                        target_id: op.target_id.clone(),
                    });
                }
                WriteOutcome::Failed { reason } => {
                    operations.remove(idx);
                    report.failed += 1;
                    log::error!(
                        "[queue] {} for {} rejected: {}",
                        op.op_type,
                        op.target_id,
                        reason
                    );
                    self.emit(QueueEvent::Failed {
                        id: op.id.clone(),
                        op_type: op.op_type,
                        target_id: op.target_id.clone(),
                        error: reason,
                    });
                }
            }

            self.persist(&operations).await?;
        }

        report.remaining = self.len().await;
        if report.attempted > 0 {
            log::info!(
                "[queue] Drain: {} delivered, {} retrying, {} abandoned, {} conflicts, {} failed, {} remaining",
                report.delivered,
                report.retrying,
                report.abandoned,
                report.conflicts,
                report.failed,
                report.remaining
            );
        }
        Ok(report)
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            log::info!("[queue] {}", if online { "Back online" } else { "Offline" });
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Snapshot of pending operations in FIFO order.
    pub async fn pending(&self) -> Vec<QueuedOperation> {
        self.operations.lock().await.clone()
    }

    /// Whether a write for `(op_type, target_id)` is waiting.
    pub async fn has_pending(&self, op_type: OperationType, target_id: &str) -> bool {
        self.operations
            .lock()
            .await
            .iter()
            .any(|op| op.coalesce_key() == (op_type, target_id))
    }

    pub async fn len(&self) -> usize {
        self.operations.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.operations.lock().await.is_empty()
    }

    pub async fn counts(&self) -> QueueCounts {
        let operations = self.operations.lock().await;
        let retrying = operations
            .iter()
            .filter(|op| op.status == QueueStatus::Retrying)
            .count();
        QueueCounts {
            queued: operations.len() - retrying,
            retrying,
        }
    }

    /// Drop a pending operation. Returns false if it was not queued.
    pub async fn discard(&self, id: &str) -> Result<bool, AppError> {
        let mut operations = self.operations.lock().await;
        let before = operations.len();
        operations.retain(|op| op.id != id);
        if operations.len() == before {
            return Ok(false);
        }
        self.persist(&operations).await?;
        drop(operations);

        log::info!("[queue] Discarded {}", id);
        self.emit(QueueEvent::Discarded { id: id.to_string() });
        Ok(true)
    }

    /// Time until the earliest pending operation is due.
    ///
    /// `None` when the queue is empty; zero when something is due now.
    pub async fn next_delay(&self) -> Option<Duration> {
        let now = Utc::now();
        self.operations
            .lock()
            .await
            .iter()
            .map(|op| match op.next_attempt_at {
                Some(at) if at > now => (at - now).to_std().unwrap_or(Duration::ZERO),
                _ => Duration::ZERO,
            })
            .min()
    }
}

/// Commands accepted by a running `QueueWorker`.
#[derive(Debug)]
enum QueueCommand {
    Trigger,
    ConnectivityRestored,
    ConnectivityLost,
    Stop,
}

/// Control handle for the background drain loop.
#[derive(Clone)]
pub struct QueueHandle {
    command_tx: mpsc::Sender<QueueCommand>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl QueueHandle {
    async fn send(&self, command: QueueCommand) -> Result<(), AppError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| AppError::internal("Queue worker not running"))
    }

    /// Drain now, regardless of the schedule.
    pub async fn trigger(&self) -> Result<(), AppError> {
        self.send(QueueCommand::Trigger).await
    }

    /// Mark the queue online and drain.
    pub async fn connectivity_restored(&self) -> Result<(), AppError> {
        self.send(QueueCommand::ConnectivityRestored).await
    }

    /// Mark the queue offline; drains are skipped until connectivity returns.
    pub async fn connectivity_lost(&self) -> Result<(), AppError> {
        self.send(QueueCommand::ConnectivityLost).await
    }

    /// Stop the worker and wait for it to exit.
    pub async fn stop(&self) -> Result<(), AppError> {
        // Already stopped is fine
        let _ = self.command_tx.send(QueueCommand::Stop).await;
        if let Some(task) = self.task.lock().await.take() {
            task.await
                .map_err(|e| AppError::internal(format!("Queue worker panicked: {}", e)))?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.command_tx.is_closed()
    }
}

/// Background drain loop for an `OfflineQueue`.
pub struct QueueWorker;

impl QueueWorker {
    /// Spawn the loop. It drains whenever the earliest operation is due,
    /// when new work is queued, and on commands from the returned handle.
    pub fn start(queue: Arc<OfflineQueue>, deliverer: Arc<dyn Deliverer>) -> QueueHandle {
        let (tx, mut rx) = mpsc::channel::<QueueCommand>(16);
        let mut events = queue.subscribe();

        let task = tokio::spawn(async move {
            log::info!("[queue] Worker started");

            loop {
                let delay = if queue.is_online() {
                    queue.next_delay().await.unwrap_or(IDLE_POLL).max(MIN_DRAIN_INTERVAL)
                } else {
                    IDLE_POLL
                };

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        if !queue.is_empty().await {
                            drain(&queue, deliverer.as_ref()).await;
                        }
                    }
                    event = events.recv() => {
                        // Enqueued work changes the schedule; recompute it
                        if let Err(broadcast::error::RecvError::Closed) = event {
                            break;
                        }
                    }
                    cmd = rx.recv() => {
                        match cmd {
                            Some(QueueCommand::Trigger) => {
                                log::debug!("[queue] Drain triggered");
                                drain(&queue, deliverer.as_ref()).await;
                            }
                            Some(QueueCommand::ConnectivityRestored) => {
                                queue.set_online(true);
                                drain(&queue, deliverer.as_ref()).await;
                            }
                            Some(QueueCommand::ConnectivityLost) => queue.set_online(false),
                            Some(QueueCommand::Stop) | None => {
                                log::info!("[queue] Worker stopping");
                                break;
                            }
                        }
                    }
                }
            }

            log::info!("[queue] Worker stopped");
        });

        QueueHandle {
            command_tx: tx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

async fn drain(queue: &OfflineQueue, deliverer: &dyn Deliverer) {
    if let Err(e) = queue.process_queue(deliverer).await {
        log::error!("[queue] Drain failed: {}", e);
    }
}
