//! Credential storage.
//!
//! Two kinds of secrets live here:
//!
//! - the long-lived user credential (identifier + PIN), read through a
//!   pluggable [`CredentialStore`] backend;
//! - the short-lived bearer token, cached in a local JSON file by
//!   [`TokenCache`] so later runs can skip interactive login.
//!
//! # Configuration
//!
//! The backend is chosen in `elbakit.toml`:
//!
//! ```toml
//! [credentials]
//! backend = "file"
//! path = "/home/me/.local/share/elbakit/.env"
//! ```

mod config;
mod env_file;
mod token_cache;

pub use config::CredentialConfig;
pub use env_file::{EnvFileStore, EnvVarStore};
pub use token_cache::{BearerToken, TokenCache, TokenSource};

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

/// Logical key for the user identifier (Verfügernummer).
pub const IDENTIFIER_KEY: &str = "id";
/// Logical key for the PIN.
pub const SECRET_KEY: &str = "pin";

/// A key-value store for credentials.
///
/// The interface is just get/set by logical key name; each backend maps
/// those keys to its own locations.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Retrieve a credential by key.
    ///
    /// Returns `Ok(None)` if the key doesn't exist.
    /// Returns `Err` if there was an error accessing the backend.
    async fn get(&self, key: &str) -> Result<Option<SecretString>>;

    /// Store a credential. Used by the `setup` flow.
    async fn set(&self, key: &str, value: SecretString) -> Result<()>;

    /// Some backends (like environment variables) are read-only.
    fn supports_write(&self) -> bool {
        true
    }
}

/// The long-lived user credential. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Credential {
    pub identifier: String,
    pub secret: SecretString,
}

impl Credential {
    pub fn new(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            secret: SecretString::from(secret.into()),
        }
    }

    /// Short, non-sensitive prefix for log lines.
    pub fn display_prefix(&self) -> &str {
        let end = self
            .identifier
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.identifier.len());
        &self.identifier[..end]
    }
}

/// Load the user credential from a store.
///
/// A missing backend file or missing keys give `Ok(None)`; the caller
/// decides whether that is fatal.
pub async fn load_credential(store: &dyn CredentialStore) -> Result<Option<Credential>> {
    let identifier = store.get(IDENTIFIER_KEY).await?;
    let secret = store.get(SECRET_KEY).await?;

    match (identifier, secret) {
        (Some(id), Some(secret))
            if !id.expose_secret().trim().is_empty() && !secret.expose_secret().is_empty() =>
        {
            Ok(Some(Credential {
                identifier: id.expose_secret().trim().to_string(),
                secret,
            }))
        }
        _ => Ok(None),
    }
}

/// Persist a credential to a writable store.
pub async fn save_credential(store: &dyn CredentialStore, credential: &Credential) -> Result<()> {
    if !store.supports_write() {
        anyhow::bail!("Credential backend is read-only");
    }
    store
        .set(
            IDENTIFIER_KEY,
            SecretString::from(credential.identifier.clone()),
        )
        .await?;
    store.set(SECRET_KEY, credential.secret.clone()).await?;
    Ok(())
}

/// Make a secret-bearing file readable by the owner only.
#[cfg(unix)]
pub(crate) fn restrict_permissions(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to restrict permissions on {}", path.display()))
}

#[cfg(not(unix))]
pub(crate) fn restrict_permissions(_path: &std::path::Path) -> Result<()> {
    Ok(())
}
