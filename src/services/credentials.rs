//! Token storage in the OS keychain.
//!
//! The GitHub token used for the data repository is kept in the platform
//! credential store (Keychain on macOS, Credential Manager on Windows,
//! Secret Service on Linux) under the API base URL as account name.

use crate::error::AppError;
use keyring::Entry;

/// Service name used in the keychain.
const SERVICE_NAME: &str = "portfolio-sync";

/// Credential storage operations.
pub struct CredentialService;

impl CredentialService {
    /// Store a token for a GitHub API endpoint.
    pub fn store_token(api_base_url: &str, token: &str) -> Result<(), AppError> {
        if token.trim().is_empty() {
            return Err(AppError::invalid_input_field("Token must not be empty", "token"));
        }
        let entry = Self::get_entry(api_base_url)?;

        entry
            .set_password(token)
            .map_err(|e| AppError::credential_storage(format!("Failed to store token: {}", e)))
    }

    /// Retrieve the token for a GitHub API endpoint.
    ///
    /// A missing entry is `NotFound`.
    pub fn get_token(api_base_url: &str) -> Result<String, AppError> {
        let entry = Self::get_entry(api_base_url)?;

        entry.get_password().map_err(|e| match e {
            keyring::Error::NoEntry => AppError::not_found_with_id("credential", api_base_url),
            _ => AppError::credential_storage(format!("Failed to retrieve token: {}", e)),
        })
    }

    /// Delete the token. Deleting a token that does not exist is not an error.
    pub fn delete_token(api_base_url: &str) -> Result<(), AppError> {
        let entry = Self::get_entry(api_base_url)?;

        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(AppError::credential_storage(format!(
                "Failed to delete token: {}",
                e
            ))),
        }
    }

    fn get_entry(api_base_url: &str) -> Result<Entry, AppError> {
        let account = normalize_url(api_base_url);

        Entry::new(SERVICE_NAME, &account).map_err(|e| {
            AppError::credential_storage(format!("Failed to create keyring entry: {}", e))
        })
    }
}

/// Trailing slashes removed, lowercased.
fn normalize_url(url: &str) -> String {
    url.trim_end_matches('/').to_lowercase()
}
