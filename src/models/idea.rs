//! Idea intake pipeline model.

use crate::error::AppError;
use crate::models::Keyed;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Status of an idea in the intake pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdeaStatus {
    #[default]
    Pending,
    InDevelopment,
    Implemented,
    Rejected,
}

impl std::fmt::Display for IdeaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InDevelopment => write!(f, "in_development"),
            Self::Implemented => write!(f, "implemented"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl IdeaStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Implemented | Self::Rejected)
    }

    /// pending -> in_development -> implemented, pending -> rejected.
    pub fn can_transition_to(&self, next: IdeaStatus) -> bool {
        use IdeaStatus::*;
        matches!(
            (self, next),
            (Pending, InDevelopment) | (InDevelopment, Implemented) | (Pending, Rejected)
        )
    }
}

/// A comment on an idea. Identified by `(author, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub body: String,
}

/// An item in the idea intake pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdeaRecord {
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub summary: Option<String>,

    #[serde(default)]
    pub submitter: Option<String>,

    #[serde(default)]
    pub status: IdeaStatus,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,

    /// Append-only.
    #[serde(default)]
    pub comments: Vec<CommentRecord>,
}

impl IdeaRecord {
    /// Create a new pending idea with a fresh id.
    pub fn new(title: impl Into<String>, submitter: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            summary: None,
            submitter,
            status: IdeaStatus::Pending,
            created_at: Some(now),
            updated_at: Some(now),
            comments: Vec::new(),
        }
    }

    /// Move the idea through its state machine.
    pub fn transition(&mut self, next: IdeaStatus) -> Result<(), AppError> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::invalid_input_field(
                format!("Cannot move idea from {} to {}", self.status, next),
                "status",
            ));
        }
        self.status = next;
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    /// Append a comment.
    pub fn add_comment(&mut self, author: impl Into<String>, body: impl Into<String>) {
        self.comments.push(CommentRecord {
            author: author.into(),
            timestamp: Utc::now(),
            body: body.into(),
        });
        self.updated_at = Some(Utc::now());
    }
}

impl Keyed for IdeaRecord {
    fn identity_key(&self) -> String {
        self.id.clone()
    }
}

/// Union of two comment lists, deduplicated on `(author, timestamp)` and
/// ordered by timestamp. The first occurrence of a duplicate wins.
pub fn merge_comments(primary: &[CommentRecord], secondary: &[CommentRecord]) -> Vec<CommentRecord> {
    let mut seen: HashSet<(String, DateTime<Utc>)> = HashSet::new();
    let mut merged: Vec<CommentRecord> = primary
        .iter()
        .chain(secondary.iter())
        .filter(|c| seen.insert((c.author.clone(), c.timestamp)))
        .cloned()
        .collect();

    merged.sort_by_key(|c| c.timestamp);
    merged
}
