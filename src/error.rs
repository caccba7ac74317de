//! Application error types.
//!
//! These errors are serializable so the UI layer can turn them into a toast
//! without ever seeing a raw backtrace.

use serde::Serialize;
use thiserror::Error;

/// Application-level errors returned by every I/O boundary in the crate.
///
/// All variants serialize to a structured JSON object for frontend consumption.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum AppError {
    /// The remote store could not be reached (offline, timeout, 5xx, 429).
    ///
    /// Retryable: writes failing this way are handed to the offline queue.
    #[error("Network unavailable: {message}")]
    NetworkUnavailable { message: String },

    /// The version token supplied on write no longer matches the remote blob.
    #[error("Remote conflict on {path}")]
    RemoteConflict {
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Requested resource not found. Expected on first run.
    #[error("Not found: {resource}")]
    NotFound {
        resource: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Remote or local content could not be parsed.
    #[error("Malformed data: {message}")]
    Malformed {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    /// The persistent local store could not be opened.
    #[error("Local store unavailable: {message}")]
    LocalStoreUnavailable { message: String },

    /// Invalid arguments from the caller (programmer error).
    #[error("Invalid input: {message}")]
    InvalidInput {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },

    /// Remote API rejected the request with a non-retryable status.
    #[error("Remote API error: {message}")]
    RemoteApi {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },

    /// Authentication failed or the token was revoked.
    #[error("Authentication error: {message}")]
    Authentication { message: String },

    /// Database operation failed.
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
    },

    /// Credential storage operation failed.
    #[error("Credential storage error: {message}")]
    CredentialStorage { message: String },

    /// Internal error.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    /// Create a network-unavailable error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkUnavailable {
            message: message.into(),
        }
    }

    /// Create a conflict error for a blob path.
    pub fn conflict(path: impl Into<String>) -> Self {
        Self::RemoteConflict {
            path: path.into(),
            message: None,
        }
    }

    /// Create a conflict error with the remote's explanation.
    pub fn conflict_with_message(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteConflict {
            path: path.into(),
            message: Some(message.into()),
        }
    }

    /// Create a not found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: None,
        }
    }

    /// Create a not found error with ID.
    pub fn not_found_with_id(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: Some(id.into()),
        }
    }

    /// Create a malformed-data error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
            path: None,
        }
    }

    /// Create a malformed-data error for a specific blob path.
    pub fn malformed_at(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
            path: Some(path.into()),
        }
    }

    /// Create a local-store-unavailable error.
    pub fn local_store(message: impl Into<String>) -> Self {
        Self::LocalStoreUnavailable {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            field: None,
        }
    }

    /// Create an invalid input error with field name.
    pub fn invalid_input_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a remote API error.
    pub fn remote_api(message: impl Into<String>) -> Self {
        Self::RemoteApi {
            message: message.into(),
            status_code: None,
            endpoint: None,
        }
    }

    /// Create a remote API error with status code and endpoint.
    pub fn remote_api_full(
        message: impl Into<String>,
        status_code: u16,
        endpoint: impl Into<String>,
    ) -> Self {
        Self::RemoteApi {
            message: message.into(),
            status_code: Some(status_code),
            endpoint: Some(endpoint.into()),
        }
    }

    /// Create an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            operation: None,
        }
    }

    /// Create a database error with operation context.
    pub fn database_with_op(message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    /// Create a credential storage error.
    pub fn credential_storage(message: impl Into<String>) -> Self {
        Self::CredentialStorage {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a write failing with this error should be queued for retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkUnavailable { .. } => true,
            Self::RemoteApi {
                status_code: Some(code),
                ..
            } => *code == 429 || *code >= 500,
            _ => false,
        }
    }

    /// Check if this is a version-token conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::RemoteConflict { .. })
    }

    /// Check if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

// Conversions from common error types

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::database(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::network("Request timed out")
        } else if err.is_connect() {
            Self::network("Failed to connect to server")
        } else if let Some(status) = err.status() {
            Self::RemoteApi {
                message: format!("HTTP error: {}", err),
                status_code: Some(status.as_u16()),
                endpoint: None,
            }
        } else {
            Self::network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::malformed(format!("YAML error: {}", err))
    }
}

impl From<crate::db::DbError> for AppError {
    fn from(err: crate::db::DbError) -> Self {
        Self::local_store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serialization() {
        let err = AppError::network("connection reset");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"type\":\"NetworkUnavailable\""));
        assert!(json.contains("connection reset"));
    }

    #[test]
    fn test_remote_api_error_full() {
        let err = AppError::remote_api_full("Bad gateway", 502, "/repos/o/r/contents/x");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"status_code\":502"));
        assert!(json.contains("/repos/o/r/contents/x"));
    }

    #[test]
    fn test_optional_fields_not_serialized() {
        let err = AppError::conflict("data/overview.json");
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("message"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AppError::network("offline").is_retryable());
        assert!(AppError::remote_api_full("x", 503, "/").is_retryable());
        assert!(AppError::remote_api_full("x", 429, "/").is_retryable());
        assert!(!AppError::remote_api_full("x", 403, "/").is_retryable());
        assert!(!AppError::conflict("p").is_retryable());
        assert!(!AppError::malformed("bad").is_retryable());
    }

    #[test]
    fn test_display_impl() {
        let err = AppError::invalid_input("target id is empty");
        assert_eq!(format!("{}", err), "Invalid input: target id is empty");
    }
}
