//! Review history entry model.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One entry in an app's review history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRecord {
    pub id: String,

    pub reviewed_at: NaiveDate,

    #[serde(default)]
    pub reviewer: Option<String>,

    #[serde(default)]
    pub notes: Option<String>,

    /// Free-form verdict, e.g. "healthy", "needs-work".
    #[serde(default)]
    pub outcome: Option<String>,
}

impl ReviewRecord {
    pub fn new(reviewed_at: NaiveDate) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            reviewed_at,
            reviewer: None,
            notes: None,
            outcome: None,
        }
    }
}

/// Most recent review date in a history, if any.
pub fn latest_review_date(reviews: &[ReviewRecord]) -> Option<NaiveDate> {
    reviews.iter().map(|r| r.reviewed_at).max()
}
