//! Local cache for the short-lived bearer token.
//!
//! Tokens are stored as `token.json` next to the browser profile:
//!
//! ```json
//! { "token": "eyJhbGciOi...", "captured_at": 1714571110 }
//! ```
//!
//! Older installs wrote the bare token as plain text; that is still read.
//! The file is assumed to be used by one process at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::restrict_permissions;
use crate::clock::{Clock, SystemClock};

const TOKEN_FILE: &str = "token.json";
const LAST_URL_FILE: &str = "last_url.txt";

/// Where a bearer token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Cache,
    Storage,
    Intercepted,
}

impl std::fmt::Display for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TokenSource::Cache => "cache",
            TokenSource::Storage => "storage",
            TokenSource::Intercepted => "intercepted",
        };
        f.write_str(s)
    }
}

/// A bearer token plus how it was acquired.
#[derive(Debug, Clone)]
pub struct BearerToken {
    value: SecretString,
    pub source: TokenSource,
}

impl BearerToken {
    pub fn new(value: impl Into<String>, source: TokenSource) -> Self {
        Self {
            value: SecretString::from(value.into()),
            source,
        }
    }

    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    /// At most 20 characters, for log lines.
    pub fn prefix(&self) -> &str {
        let value = self.expose();
        let end = value
            .char_indices()
            .nth(20)
            .map(|(i, _)| i)
            .unwrap_or(value.len());
        &value[..end]
    }

    /// Compare token values, ignoring the source.
    pub fn same_value(&self, other: &BearerToken) -> bool {
        self.expose() == other.expose()
    }

    /// `Authorization` header value.
    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.expose())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedTokenFile {
    token: String,
    #[serde(default)]
    captured_at: Option<i64>,
}

/// File-backed token cache plus the last-URL marker.
pub struct TokenCache {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl TokenCache {
    /// Create a cache rooted at `dir`, creating the directory if needed.
    pub fn with_path(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create token cache dir: {dir:?}"))?;
        Ok(Self {
            dir,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn token_file(&self) -> PathBuf {
        self.dir.join(TOKEN_FILE)
    }

    fn last_url_file(&self) -> PathBuf {
        self.dir.join(LAST_URL_FILE)
    }

    /// Persist a token, replacing any previous one.
    pub fn cache_token(&self, token: &BearerToken) -> Result<()> {
        let path = self.token_file();
        let file = CachedTokenFile {
            token: token.expose().to_string(),
            captured_at: Some(self.clock.unix_timestamp()),
        };
        let content = serde_json::to_string_pretty(&file).context("Failed to serialize token")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write token file: {path:?}"))?;
        restrict_permissions(&path)?;
        tracing::debug!(prefix = token.prefix(), source = %token.source, "Cached bearer token");
        Ok(())
    }

    /// Load the cached token.
    ///
    /// Missing, unreadable, or corrupt files all give `None`; only the last
    /// two are logged.
    pub fn load_cached_token(&self) -> Option<BearerToken> {
        let path = self.token_file();
        if !path.exists() {
            return None;
        }
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read token cache");
                return None;
            }
        };
        match parse_token_file(&content) {
            Some(token) => Some(BearerToken::new(token, TokenSource::Cache)),
            None => {
                tracing::warn!(path = %path.display(), "Ignoring corrupt token cache");
                None
            }
        }
    }

    pub fn clear_cached_token(&self) -> Result<()> {
        let path = self.token_file();
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to delete token file: {path:?}"))?;
        }
        Ok(())
    }

    pub fn write_last_url(&self, url: &str) -> Result<()> {
        let path = self.last_url_file();
        std::fs::write(&path, url)
            .with_context(|| format!("Failed to write last URL file: {path:?}"))
    }

    pub fn read_last_url(&self) -> Option<String> {
        std::fs::read_to_string(self.last_url_file())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn clear_last_url(&self) -> Result<()> {
        let path = self.last_url_file();
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to delete last URL file: {path:?}"))?;
        }
        Ok(())
    }
}

fn parse_token_file(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('{') {
        return serde_json::from_str::<CachedTokenFile>(trimmed)
            .ok()
            .map(|f| f.token)
            .filter(|t| !t.is_empty());
    }
    // Legacy plain-text file.
    if trimmed.contains(char::is_whitespace) {
        return None;
    }
    Some(trimmed.to_string())
}
