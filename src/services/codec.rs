//! Blob content encoding.
//!
//! The dataset mixes JSON (overview, task and review lists) and YAML (idea
//! documents). The format is chosen by the blob path's extension.

use crate::error::AppError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialization format of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobFormat {
    Json,
    Yaml,
}

impl BlobFormat {
    /// Pick the format from a path. Anything that is not `.yml`/`.yaml` is JSON.
    pub fn from_path(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".yml") || lower.ends_with(".yaml") {
            Self::Yaml
        } else {
            Self::Json
        }
    }
}

/// Decode blob content into `T`.
///
/// Errors carry the path so a malformed blob can be found in the data repo.
pub fn decode<T: DeserializeOwned>(path: &str, content: &str) -> Result<T, AppError> {
    let result = match BlobFormat::from_path(path) {
        BlobFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
        BlobFormat::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
    };
    result.map_err(|e| AppError::malformed_at(e, path))
}

/// Encode `value` for storage at `path`.
pub fn encode<T: Serialize + ?Sized>(path: &str, value: &T) -> Result<String, AppError> {
    match BlobFormat::from_path(path) {
        BlobFormat::Json => {
            let mut json = serde_json::to_string_pretty(value)?;
            json.push('\n');
            Ok(json)
        }
        BlobFormat::Yaml => Ok(serde_yaml::to_string(value)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IdeaRecord, TaskRecord};

    #[test]
    fn test_format_from_path() {
        assert_eq!(BlobFormat::from_path("data/ideas/x.yml"), BlobFormat::Yaml);
        assert_eq!(BlobFormat::from_path("data/ideas/x.YAML"), BlobFormat::Yaml);
        assert_eq!(BlobFormat::from_path("data/overview.json"), BlobFormat::Json);
    }

    #[test]
    fn test_yaml_idea_document() {
        let yaml = "id: idea-1\ntitle: \"Dark mode: everywhere\"\nstatus: pending\ncomments:\n  - author: ana\n    timestamp: 2024-02-01T10:00:00Z\n    body: \"+1, with a toggle\"\n";
        let idea: IdeaRecord = decode("data/ideas/idea-1.yml", yaml).unwrap();
        assert_eq!(idea.title, "Dark mode: everywhere");
        assert_eq!(idea.comments.len(), 1);
        assert_eq!(idea.comments[0].body, "+1, with a toggle");
    }

    #[test]
    fn test_malformed_content_names_path() {
        let err = decode::<Vec<TaskRecord>>("data/apps/a/tasks.json", "{not json").unwrap_err();
        match err {
            AppError::Malformed { path, .. } => {
                assert_eq!(path.as_deref(), Some("data/apps/a/tasks.json"))
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_encode_json_is_pretty() {
        let tasks = vec![TaskRecord::new("Ship it")];
        let encoded = encode("data/apps/a/tasks.json", &tasks).unwrap();
        assert!(encoded.starts_with("[\n"));
        assert!(encoded.ends_with('\n'));
    }

    #[test]
    fn test_encode_borrowed_slice() {
        let tasks = vec![TaskRecord::new("a"), TaskRecord::new("b")];
        let slice: &[TaskRecord] = &tasks[..1];
        let encoded = encode("data/apps/a/tasks.json", slice).unwrap();
        let decoded: Vec<TaskRecord> = decode("data/apps/a/tasks.json", &encoded).unwrap();
        assert_eq!(decoded, tasks[..1].to_vec());
    }
}
