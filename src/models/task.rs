//! Task model attached to an app.

use crate::error::AppError;
use crate::models::Keyed;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Task priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

impl From<&str> for TaskPriority {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Medium,
        }
    }
}

/// Workflow status of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Draft,
    Submitted,
    InDevelopment,
    Complete,
    Rejected,
}

impl From<&str> for TaskStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().replace('-', "_").as_str() {
            "submitted" => Self::Submitted,
            "in_development" => Self::InDevelopment,
            "complete" | "completed" => Self::Complete,
            "rejected" => Self::Rejected,
            _ => Self::Draft,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Submitted => write!(f, "submitted"),
            Self::InDevelopment => write!(f, "in_development"),
            Self::Complete => write!(f, "complete"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl TaskStatus {
    /// Whether no further transitions are allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Rejected)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Draft, Submitted)
                | (Draft, InDevelopment)
                | (Submitted, InDevelopment)
                | (Submitted, Rejected)
                | (InDevelopment, Complete)
                | (InDevelopment, Rejected)
        )
    }
}

/// A unit of work attached to an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// Unique id. Always assigned for new tasks; absent only in legacy blobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub priority: TaskPriority,

    #[serde(default)]
    pub due_date: Option<NaiveDate>,

    #[serde(default)]
    pub completed: bool,

    #[serde(default)]
    pub status: TaskStatus,

    /// Provenance tag: `manual`, `public-submission`, ...
    #[serde(default)]
    pub source: Option<String>,

    #[serde(default)]
    pub submitter: Option<String>,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Provenance tag for tasks entered through the public submission form.
    pub const PUBLIC_SUBMISSION: &'static str = "public-submission";

    /// Create a new task with a fresh unique id.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: Some(uuid::Uuid::new_v4().to_string()),
            title: title.into(),
            description: None,
            priority: TaskPriority::Medium,
            due_date: None,
            completed: false,
            status: TaskStatus::Draft,
            source: Some("manual".to_string()),
            submitter: None,
            created_at: Some(Utc::now()),
        }
    }

    /// Create a task submitted by someone outside the portfolio owner.
    pub fn submission(title: impl Into<String>, submitter: impl Into<String>) -> Self {
        let mut task = Self::new(title);
        task.status = TaskStatus::Submitted;
        task.source = Some(Self::PUBLIC_SUBMISSION.to_string());
        task.submitter = Some(submitter.into());
        task
    }

    /// Assign an id to a legacy task that has none.
    pub fn ensure_id(&mut self) {
        if self.id.as_deref().map_or(true, str::is_empty) {
            self.id = Some(uuid::Uuid::new_v4().to_string());
        }
    }

    /// Move the task to a new status, keeping `completed` consistent.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), AppError> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::invalid_input_field(
                format!("Cannot move task from {} to {}", self.status, next),
                "status",
            ));
        }
        self.status = next;
        self.completed = next == TaskStatus::Complete;
        Ok(())
    }
}

impl Keyed for TaskRecord {
    /// The id when present, otherwise `title|dueDate`.
    ///
    /// The fallback collides for two tasks with the same title and due date;
    /// it exists only so id-less legacy records still merge.
    fn identity_key(&self) -> String {
        match self.id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!(
                "{}|{}",
                self.title.trim().to_lowercase(),
                self.due_date.map(|d| d.to_string()).unwrap_or_default()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_has_unique_id() {
        let a = TaskRecord::new("Write docs");
        let b = TaskRecord::new("Write docs");
        assert!(a.id.is_some());
        assert_ne!(a.identity_key(), b.identity_key());
    }

    #[test]
    fn test_synthetic_key_for_legacy_task() {
        let json = r#"{"title": "Fix Login ", "dueDate": "2024-02-01"}"#;
        let task: TaskRecord = serde_json::from_str(json).unwrap();
        assert_eq!(task.identity_key(), "fix login|2024-02-01");

        let mut task = task;
        task.ensure_id();
        assert_ne!(task.identity_key(), "fix login|2024-02-01");
    }

    #[test]
    fn test_partial_records_use_defaults() {
        let json = r#"[{"id":"t1","completed":true},{"id":"t2","title":"new"}]"#;
        let tasks: Vec<TaskRecord> = serde_json::from_str(json).unwrap();
        assert_eq!(tasks[0].title, "");
        assert!(tasks[0].completed);
        assert_eq!(tasks[1].title, "new");
        assert_eq!(tasks[1].status, TaskStatus::Draft);
    }

    #[test]
    fn test_status_transitions() {
        let mut task = TaskRecord::submission("Dark mode", "visitor@example.com");
        assert_eq!(task.status, TaskStatus::Submitted);
        assert_eq!(task.source.as_deref(), Some(TaskRecord::PUBLIC_SUBMISSION));

        task.transition(TaskStatus::InDevelopment).unwrap();
        task.transition(TaskStatus::Complete).unwrap();
        assert!(task.completed);

        assert!(task.transition(TaskStatus::Submitted).is_err());
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!(TaskStatus::from("in-development"), TaskStatus::InDevelopment);
        assert_eq!(TaskStatus::from("COMPLETED"), TaskStatus::Complete);
        assert_eq!(TaskStatus::from("unknown"), TaskStatus::Draft);
        assert_eq!(TaskStatus::InDevelopment.to_string(), "in_development");
    }
}
