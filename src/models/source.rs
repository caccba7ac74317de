//! Repository listing entry from the source-of-truth enumeration API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One repository as reported by the hosting platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRepository {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stars: u32,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub archived: bool,
}
