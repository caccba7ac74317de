//! Queued operation model for deferred remote writes.

use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Kind of deferred write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Full task list of one app.
    Tasks,
    /// Review history of one app.
    Reviews,
    /// One idea document.
    Ideas,
}

impl FromStr for OperationType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tasks" => Ok(Self::Tasks),
            "reviews" => Ok(Self::Reviews),
            "ideas" => Ok(Self::Ideas),
            other => Err(AppError::invalid_input_field(
                format!("Unknown operation type '{}'", other),
                "type",
            )),
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tasks => write!(f, "tasks"),
            Self::Reviews => write!(f, "reviews"),
            Self::Ideas => write!(f, "ideas"),
        }
    }
}

/// Status of an operation while it is still in the queue.
///
/// Delivered and abandoned operations leave the queue and are only reported
/// through queue events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    #[default]
    Queued,
    Retrying,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

/// Durable description of a write that could not complete immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    /// Local operation ID.
    pub id: String,

    #[serde(rename = "type")]
    pub op_type: OperationType,

    /// App id for tasks/reviews, idea id for ideas.
    pub target_id: String,

    /// Full replacement payload (task list, review list or idea document).
    pub payload: serde_json::Value,

    /// Number of failed delivery attempts.
    #[serde(default)]
    pub retries: u32,

    pub queued_at: DateTime<Utc>,

    #[serde(default)]
    pub last_error: Option<String>,

    /// Earliest time the next attempt may run (None = immediately).
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub status: QueueStatus,
}

impl QueuedOperation {
    /// Default number of failed attempts before an operation is abandoned.
    pub const MAX_RETRIES: u32 = 5;

    pub fn new(op_type: OperationType, target_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            op_type,
            target_id: target_id.into(),
            payload,
            retries: 0,
            queued_at: Utc::now(),
            last_error: None,
            next_attempt_at: None,
            status: QueueStatus::Queued,
        }
    }

    /// Key under which operations are coalesced.
    pub fn coalesce_key(&self) -> (OperationType, &str) {
        (self.op_type, self.target_id.as_str())
    }

    /// Whether the operation may be attempted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Check if the operation can be retried once more.
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.retries < max_retries
    }
}
