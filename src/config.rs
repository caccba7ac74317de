//! Portfolio configuration.
//!
//! Settings are persisted as a JSON file next to the local database. Any
//! field missing from the file falls back to its default, and a handful of
//! environment variables override the file for deployment.

use crate::error::AppError;
use crate::services::credentials::CredentialService;
use crate::services::github_client::GitHubClientConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default review cycle in days.
///
/// How long a cycle should be is a product decision; this is only the value
/// used when the settings file does not say.
pub const DEFAULT_REVIEW_CYCLE_DAYS: u32 = 90;

/// Default TTL for the remote read cache.
pub const DEFAULT_READ_CACHE_TTL_SECS: u64 = 30;

/// Default backoff schedule between delivery attempts.
pub const DEFAULT_BACKOFF_SECS: [u64; 5] = [1, 2, 5, 10, 30];

/// GitHub connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubSettings {
    /// API base URL (e.g., `https://api.github.com`).
    pub api_base_url: String,

    /// Account whose repositories make up the portfolio.
    pub owner: String,

    /// Repository holding the dataset blobs.
    pub data_repo: String,

    /// Branch the dataset lives on.
    pub branch: String,

    /// Personal access token. Never written back to the settings file.
    #[serde(skip_serializing)]
    pub token: Option<String>,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for GitHubSettings {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.github.com".to_string(),
            owner: String::new(),
            data_repo: String::new(),
            branch: "main".to_string(),
            token: None,
            timeout_secs: 15,
        }
    }
}

/// Offline queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Failed attempts before an operation is abandoned.
    pub max_retries: u32,

    /// Delay before attempt N+1 after N failures. The last entry repeats.
    pub backoff_secs: Vec<u64>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_secs: DEFAULT_BACKOFF_SECS.to_vec(),
        }
    }
}

impl QueueSettings {
    /// Delay after `failures` failed attempts (1-based).
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let idx = (failures.max(1) - 1) as usize;
        let secs = self
            .backoff_secs
            .get(idx)
            .or_else(|| self.backoff_secs.last())
            .copied()
            .unwrap_or(1);
        Duration::from_secs(secs)
    }
}

/// Circuit breaker settings for the remote store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    /// Consecutive retryable failures that open the circuit.
    pub failure_threshold: u32,

    /// How long the circuit stays open.
    pub cooldown_secs: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 30,
        }
    }
}

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioConfig {
    pub github: GitHubSettings,

    /// Directory inside the data repo that holds the dataset.
    pub data_root: String,

    /// SQLite file for the local cache. None keeps everything in memory.
    pub db_path: Option<PathBuf>,

    pub review_cycle_days: u32,

    pub read_cache_ttl_secs: u64,

    /// Repository names never shown in the portfolio.
    pub excluded_repos: Vec<String>,

    /// Whether private repositories are tracked.
    pub include_private: bool,

    pub queue: QueueSettings,

    pub circuit: CircuitSettings,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            github: GitHubSettings::default(),
            data_root: "data".to_string(),
            db_path: None,
            review_cycle_days: DEFAULT_REVIEW_CYCLE_DAYS,
            read_cache_ttl_secs: DEFAULT_READ_CACHE_TTL_SECS,
            excluded_repos: Vec::new(),
            include_private: false,
            queue: QueueSettings::default(),
            circuit: CircuitSettings::default(),
        }
    }
}

impl PortfolioConfig {
    /// Load settings from a JSON file, using defaults if the file is absent.
    ///
    /// Environment overrides are applied on top.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                AppError::internal(format!("Failed to read settings {}: {}", path.display(), e))
            })?;
            serde_json::from_str::<Self>(&raw).map_err(|e| {
                AppError::malformed_at(format!("Invalid settings file: {}", e), path.display().to_string())
            })?
        } else {
            log::info!("[config] No settings at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Save settings to a JSON file. The token is never written.
    pub fn save(&self, path: &Path) -> Result<(), AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::internal(format!("Failed to create settings dir: {}", e)))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| AppError::internal(format!("Failed to save settings: {}", e)))
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("PORTFOLIO_GITHUB_TOKEN").filter(|t| !t.is_empty()) {
            self.github.token = Some(token);
        }
        if let Some(owner) = lookup("PORTFOLIO_OWNER") {
            self.github.owner = owner;
        }
        if let Some(repo) = lookup("PORTFOLIO_DATA_REPO") {
            self.github.data_repo = repo;
        }
        if let Some(branch) = lookup("PORTFOLIO_BRANCH") {
            self.github.branch = branch;
        }
    }

    /// Reject settings the rest of the crate cannot work with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.queue.backoff_secs.is_empty() {
            return Err(AppError::invalid_input_field(
                "Backoff schedule must not be empty",
                "queue.backoff_secs",
            ));
        }
        if self.queue.max_retries == 0 {
            return Err(AppError::invalid_input_field(
                "max_retries must be at least 1",
                "queue.max_retries",
            ));
        }
        if self.review_cycle_days == 0 {
            return Err(AppError::invalid_input_field(
                "Review cycle must be at least one day",
                "review_cycle_days",
            ));
        }
        Ok(())
    }

    pub fn read_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.read_cache_ttl_secs)
    }

    /// Whether a repository name is on the exclusion list.
    pub fn is_excluded(&self, name_or_id: &str) -> bool {
        self.excluded_repos
            .iter()
            .any(|excluded| excluded.eq_ignore_ascii_case(name_or_id))
    }

    /// Resolve the API token: explicit setting first, then the OS keychain.
    pub fn resolve_token(&self) -> Option<String> {
        if let Some(token) = self.github.token.clone() {
            return Some(token);
        }
        match CredentialService::get_token(&self.github.api_base_url) {
            Ok(token) => Some(token),
            Err(e) => {
                log::debug!("[config] No keychain token: {}", e);
                None
            }
        }
    }

    /// Build the HTTP client configuration.
    pub fn github_client_config(&self) -> GitHubClientConfig {
        GitHubClientConfig {
            base_url: self.github.api_base_url.clone(),
            token: self.resolve_token(),
            owner: self.github.owner.clone(),
            data_repo: self.github.data_repo.clone(),
            branch: self.github.branch.clone(),
            timeout_secs: self.github.timeout_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = PortfolioConfig::default();
        assert_eq!(config.review_cycle_days, DEFAULT_REVIEW_CYCLE_DAYS);
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.backoff_secs, vec![1, 2, 5, 10, 30]);
        assert!(!config.include_private);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_schedule_repeats_last() {
        let queue = QueueSettings::default();
        assert_eq!(queue.backoff_for(1), Duration::from_secs(1));
        assert_eq!(queue.backoff_for(3), Duration::from_secs(5));
        assert_eq!(queue.backoff_for(5), Duration::from_secs(30));
        assert_eq!(queue.backoff_for(9), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_settings_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"github": {"owner": "octo"}, "excluded_repos": ["dotfiles"], "review_cycle_days": 30}"#,
        )
        .unwrap();

        let config = PortfolioConfig::load(&path).unwrap();
        assert_eq!(config.github.owner, "octo");
        assert_eq!(config.github.branch, "main");
        assert_eq!(config.review_cycle_days, 30);
        assert!(config.is_excluded("DotFiles"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = PortfolioConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.data_root, "data");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PORTFOLIO_GITHUB_TOKEN", "ghp_test"),
            ("PORTFOLIO_OWNER", "someone"),
        ]
        .into_iter()
        .collect();

        let mut config = PortfolioConfig::default();
        config.apply_env_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.github.token.as_deref(), Some("ghp_test"));
        assert_eq!(config.github.owner, "someone");
        assert_eq!(config.github.data_repo, "");
    }

    #[test]
    fn test_token_not_saved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut config = PortfolioConfig::default();
        config.github.token = Some("secret".to_string());
        config.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("secret"));
    }

    #[test]
    fn test_validate_rejects_empty_backoff() {
        let mut config = PortfolioConfig::default();
        config.queue.backoff_secs.clear();
        assert!(config.validate().is_err());
    }
}
