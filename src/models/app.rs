//! Tracked application (repository) model.

use crate::models::source::SourceRepository;
use crate::models::task::TaskRecord;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a tracked app.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppStatus {
    #[default]
    Active,
    Archived,
}

impl From<&str> for AppStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "archived" => Self::Archived,
            _ => Self::Active,
        }
    }
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Archived => write!(f, "Archived"),
        }
    }
}

fn default_platform() -> String {
    "Web".to_string()
}

/// One tracked repository/application in the portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRecord {
    /// Stable lowercase-kebab identity, derived once from the source name.
    pub id: String,

    /// Display name (usually the repository name).
    #[serde(default)]
    pub name: String,

    /// Pointer to the canonical source (repository URL).
    #[serde(default)]
    pub remote_ref: String,

    /// Target platform, e.g. "Web", "iOS".
    #[serde(default = "default_platform")]
    pub platform: String,

    #[serde(default)]
    pub status: AppStatus,

    #[serde(default)]
    pub last_review_date: Option<NaiveDate>,

    /// Derived from `last_review_date` and the configured review cycle.
    #[serde(default)]
    pub next_review_date: Option<NaiveDate>,

    #[serde(default)]
    pub notes: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub last_commit_date: Option<DateTime<Utc>>,

    #[serde(default)]
    pub star_count: u32,

    #[serde(default)]
    pub language: Option<String>,

    #[serde(default)]
    pub is_private: bool,

    #[serde(default)]
    pub archived: bool,

    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
}

/// Derive the stable app id from a repository name.
///
/// Lowercases, maps every run of non-alphanumeric characters to a single `-`
/// and trims leading/trailing dashes: `"My_Cool App"` becomes `"my-cool-app"`.
pub fn app_id_from_name(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    let mut pending_dash = false;

    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !id.is_empty() {
                id.push('-');
            }
            pending_dash = false;
            id.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    id
}

impl AppRecord {
    /// Create an empty record for a name, deriving its id.
    pub fn new(name: &str) -> Self {
        Self {
            id: app_id_from_name(name),
            name: name.to_string(),
            remote_ref: String::new(),
            platform: default_platform(),
            status: AppStatus::Active,
            last_review_date: None,
            next_review_date: None,
            notes: None,
            description: None,
            last_commit_date: None,
            star_count: 0,
            language: None,
            is_private: false,
            archived: false,
            tasks: Vec::new(),
        }
    }

    /// Build a record from a repository listing entry.
    pub fn from_source(repo: &SourceRepository) -> Self {
        let mut app = Self::new(&repo.name);
        app.remote_ref = repo.url.clone();
        app.description = repo.description.clone();
        app.last_commit_date = repo.updated_at;
        app.star_count = repo.stars;
        app.language = repo.language.clone();
        app.is_private = repo.is_private;
        app.archived = repo.archived;
        if repo.archived {
            app.status = AppStatus::Archived;
        }
        app
    }

    /// Record a review on `date` and recompute the next review date.
    ///
    /// Older dates never move `last_review_date` backwards.
    pub fn record_review(&mut self, date: NaiveDate, cycle_days: u32) {
        match self.last_review_date {
            Some(existing) if existing >= date => {}
            _ => self.last_review_date = Some(date),
        }
        self.refresh_next_review(cycle_days);
    }

    /// Recompute `next_review_date` from `last_review_date`.
    pub fn refresh_next_review(&mut self, cycle_days: u32) {
        self.next_review_date = self
            .last_review_date
            .map(|last| next_review_date(last, cycle_days));
    }

    /// Whether the app is due for review on `today`.
    pub fn is_review_due(&self, today: NaiveDate) -> bool {
        match self.next_review_date {
            Some(next) => next <= today,
            None => true,
        }
    }
}

/// Next review date for a given last review and cycle length.
pub fn next_review_date(last: NaiveDate, cycle_days: u32) -> NaiveDate {
    last + Duration::days(i64::from(cycle_days))
}
