//! GitHub API client.
//!
//! Implements `BlobStore` over the Contents API of the data repository and
//! `SourceListing` over the repository listing of the portfolio owner.

use crate::error::AppError;
use crate::models::SourceRepository;
use crate::services::blob_store::{Blob, BlobStore, SourceListing};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// GitHub client configuration.
#[derive(Debug, Clone)]
pub struct GitHubClientConfig {
    /// API base URL (e.g., `https://api.github.com`).
    pub base_url: String,

    /// Personal access token. Anonymous access works for public reads only.
    pub token: Option<String>,

    /// Account owning the data repository and the listed repositories.
    pub owner: String,

    /// Repository holding the dataset.
    pub data_repo: String,

    /// Branch the dataset lives on.
    pub branch: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for GitHubClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            token: None,
            owner: String::new(),
            data_repo: String::new(),
            branch: "main".to_string(),
            timeout_secs: 15,
        }
    }
}

/// GitHub API client.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: Client,
    config: GitHubClientConfig,
}

/// File entry from the Contents API.
#[derive(Debug, Clone, Deserialize)]
struct ContentFile {
    #[serde(default)]
    content: Option<String>,
    sha: String,
    #[serde(default)]
    encoding: Option<String>,
}

/// Directory entry from the Contents API.
#[derive(Debug, Clone, Deserialize)]
struct ContentEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

/// Body of a create/update file request.
#[derive(Debug, Serialize)]
struct PutContentRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PutContentResponse {
    content: PutContentFile,
}

#[derive(Debug, Deserialize)]
struct PutContentFile {
    sha: String,
}

/// Repository from the listing API.
#[derive(Debug, Clone, Deserialize)]
struct GitHubRepository {
    name: String,
    html_url: String,
    description: Option<String>,
    pushed_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    stargazers_count: u32,
    language: Option<String>,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    archived: bool,
}

impl From<GitHubRepository> for SourceRepository {
    fn from(repo: GitHubRepository) -> Self {
        Self {
            name: repo.name,
            url: repo.html_url,
            description: repo.description,
            updated_at: repo.pushed_at.or(repo.updated_at),
            stars: repo.stargazers_count,
            language: repo.language,
            is_private: repo.private,
            archived: repo.archived,
        }
    }
}

/// Page number of the `rel="next"` link in a `Link` header.
fn parse_next_page(link_header: &str) -> Option<u32> {
    link_header
        .split(',')
        .find(|part| part.contains("rel=\"next\""))
        .and_then(|part| {
            let url = part.split(';').next()?.trim().trim_matches(|c| c == '<' || c == '>');
            let query = url.split('?').nth(1)?;
            query
                .split('&')
                .find_map(|pair| pair.strip_prefix("page="))
                .and_then(|page| page.parse().ok())
        })
}

/// Percent-encode each segment of a blob path, keeping the separators.
fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

impl GitHubClient {
    /// Create a new GitHub client.
    pub fn new(config: GitHubClientConfig) -> Result<Self, AppError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            header::HeaderValue::from_static("2022-11-28"),
        );

        if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
            let mut value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| AppError::authentication("Invalid token format"))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(concat!("portfolio-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &GitHubClientConfig {
        &self.config
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn contents_endpoint(&self, path: &str) -> String {
        format!(
            "/repos/{}/{}/contents/{}",
            self.config.owner,
            self.config.data_repo,
            encode_path(path)
        )
    }

    /// Turn an unsuccessful response into an `AppError`.
    async fn error_for(response: Response, endpoint: &str) -> AppError {
        let status = response.status();
        let rate_limited = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "0");

        if status == StatusCode::UNAUTHORIZED {
            return AppError::authentication("GitHub token expired or revoked");
        }

        let status_code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        // GitHub returns errors as {"message": "...", "documentation_url": "..."}
        let body_message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from));

        if status == StatusCode::FORBIDDEN && rate_limited {
            return AppError::remote_api_full("Rate limit exceeded", 429, endpoint);
        }

        let message = match (status, body_message) {
            (StatusCode::FORBIDDEN, _) => "Access denied".to_string(),
            (StatusCode::TOO_MANY_REQUESTS, _) => "Rate limit exceeded".to_string(),
            (_, Some(msg)) => msg,
            _ => format!("Request failed ({}): {}", status_code, body),
        };

        AppError::remote_api_full(message, status_code, endpoint)
    }

    /// Deserialize a successful response or map the failure.
    async fn handle_response<T: DeserializeOwned>(
        response: Response,
        endpoint: &str,
    ) -> Result<T, AppError> {
        if response.status().is_success() {
            response.json::<T>().await.map_err(|e| {
                AppError::malformed_at(format!("Failed to parse response: {}", e), endpoint)
            })
        } else {
            Err(Self::error_for(response, endpoint).await)
        }
    }

    /// Fetch a file from the data repository. 404 is `None`.
    async fn get_contents(&self, path: &str) -> Result<Option<ContentFile>, AppError> {
        let endpoint = self.contents_endpoint(path);
        let response = self
            .client
            .get(self.api_url(&endpoint))
            .query(&[("ref", self.config.branch.as_str())])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::handle_response(response, &endpoint).await.map(Some)
    }

    /// List a directory of the data repository. 404 is empty.
    async fn get_directory(&self, dir: &str) -> Result<Vec<ContentEntry>, AppError> {
        let endpoint = self.contents_endpoint(dir);
        let response = self
            .client
            .get(self.api_url(&endpoint))
            .query(&[("ref", self.config.branch.as_str())])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        Self::handle_response(response, &endpoint).await
    }

    /// Create or update a file, returning the new blob SHA.
    async fn put_contents(
        &self,
        path: &str,
        content: &str,
        sha: Option<&str>,
        message: &str,
    ) -> Result<String, AppError> {
        let endpoint = self.contents_endpoint(path);
        let body = PutContentRequest {
            message,
            content: STANDARD.encode(content.as_bytes()),
            branch: &self.config.branch,
            sha,
        };

        let response = self
            .client
            .put(self.api_url(&endpoint))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::conflict_with_message(path, text));
        }
        // 422 is a conflict only when the sha is missing for an existing file
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            let text = response.text().await.unwrap_or_default();
            if text.to_ascii_lowercase().contains("sha") {
                return Err(AppError::conflict_with_message(path, text));
            }
            return Err(AppError::remote_api_full(text, status.as_u16(), endpoint));
        }

        let created: PutContentResponse = Self::handle_response(response, &endpoint).await?;
        Ok(created.content.sha)
    }

    /// Fetch every page of the owner's repositories.
    pub async fn list_owner_repositories(&self, owner: &str) -> Result<Vec<SourceRepository>, AppError> {
        let endpoint = format!("/users/{}/repos", urlencoding::encode(owner));
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            let response = self
                .client
                .get(self.api_url(&endpoint))
                .query(&[
                    ("page", page.to_string()),
                    ("per_page", "100".to_string()),
                    ("sort", "pushed".to_string()),
                ])
                .send()
                .await?;

            let next = response
                .headers()
                .get(header::LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_next_page);

            let repos: Vec<GitHubRepository> = Self::handle_response(response, &endpoint).await?;
            all.extend(repos.into_iter().map(SourceRepository::from));

            match next {
                Some(next_page) if next_page > page => page = next_page,
                _ => break,
            }
        }

        log::debug!("[remote] Listed {} repositories for {}", all.len(), owner);
        Ok(all)
    }
}

#[async_trait]
impl BlobStore for GitHubClient {
    async fn read(&self, path: &str) -> Result<Option<Blob>, AppError> {
        let Some(file) = self.get_contents(path).await? else {
            return Ok(None);
        };

        if file.encoding.as_deref().is_some_and(|e| e != "base64") {
            return Err(AppError::malformed_at(
                format!("Unsupported content encoding {:?}", file.encoding),
                path,
            ));
        }

        // The API wraps base64 at 60 columns
        let encoded: String = file
            .content
            .unwrap_or_default()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| AppError::malformed_at(format!("Invalid base64: {}", e), path))?;
        let content = String::from_utf8(bytes)
            .map_err(|e| AppError::malformed_at(format!("Invalid UTF-8: {}", e), path))?;

        Ok(Some(Blob {
            content,
            version_token: file.sha,
        }))
    }

    async fn write(
        &self,
        path: &str,
        content: &str,
        expected_token: Option<&str>,
        message: &str,
    ) -> Result<String, AppError> {
        self.put_contents(path, content, expected_token, message).await
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>, AppError> {
        Ok(self
            .get_directory(dir)
            .await?
            .into_iter()
            .filter(|entry| entry.kind == "file")
            .map(|entry| entry.path)
            .collect())
    }
}

#[async_trait]
impl SourceListing for GitHubClient {
    async fn list_repositories(&self, owner: &str) -> Result<Vec<SourceRepository>, AppError> {
        self.list_owner_repositories(owner).await
    }
}
