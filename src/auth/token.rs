//! Bearer token resolution.
//!
//! A [`TokenResolver`] walks an ordered chain of [`TokenStrategy`] objects,
//! cheapest first, and returns the first token found:
//!
//! 1. [`CachedToken`]: the local cache file (no browser calls at all);
//! 2. [`PersistedStorage`]: localStorage the browser profile has persisted;
//! 3. [`LiveStorage`]: local/session storage of the current page;
//! 4. [`NetworkCapture`]: load the dashboard and read the `Authorization`
//!    header off the app's own API calls.
//!
//! Tokens found by steps 2-4 are written through to the cache.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;

use crate::browser::{AuthorizationObserver, BrowserSession, StorageEntry};
use crate::config::{PortalConfig, ResolvedConfig, TimeoutConfig};
use crate::credentials::{BearerToken, TokenCache, TokenSource};

/// Requests the portal's own frontend sends with a bearer header.
pub const API_REQUEST_PATTERN: &str = "*/api/*";

/// One way of finding a bearer token.
#[async_trait]
pub trait TokenStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(&self, browser: &dyn BrowserSession) -> Result<Option<BearerToken>>;
}

/// Ordered strategy chain with write-through caching.
pub struct TokenResolver {
    cache: Arc<TokenCache>,
    strategies: Vec<Box<dyn TokenStrategy>>,
}

impl TokenResolver {
    pub fn new(cache: Arc<TokenCache>, strategies: Vec<Box<dyn TokenStrategy>>) -> Self {
        Self { cache, strategies }
    }

    /// The standard chain: cache, persisted storage, live storage, capture.
    pub fn standard(cache: Arc<TokenCache>, config: &ResolvedConfig) -> Self {
        let strategies: Vec<Box<dyn TokenStrategy>> = vec![
            Box::new(CachedToken::new(cache.clone())),
            Box::new(PersistedStorage),
            Box::new(LiveStorage),
            Box::new(NetworkCapture::new(&config.portal, &config.timeouts)),
        ];
        Self::new(cache, strategies)
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Find a token. `None` means every strategy came up empty.
    pub async fn resolve(&self, browser: &dyn BrowserSession) -> Option<BearerToken> {
        for strategy in &self.strategies {
            let token = match strategy.resolve(browser).await {
                Ok(Some(token)) => token,
                Ok(None) => {
                    tracing::debug!(strategy = strategy.name(), "No token");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(strategy = strategy.name(), error = %e, "Token strategy failed");
                    continue;
                }
            };

            tracing::info!(
                strategy = strategy.name(),
                source = %token.source,
                prefix = token.prefix(),
                "Resolved bearer token"
            );
            if token.source != TokenSource::Cache {
                if let Err(e) = self.cache.cache_token(&token) {
                    tracing::warn!(error = %e, "Failed to cache bearer token");
                }
            }
            return Some(token);
        }
        None
    }

    /// Drop the cached token after the server rejected it.
    pub fn invalidate(&self) {
        if let Err(e) = self.cache.clear_cached_token() {
            tracing::warn!(error = %e, "Failed to clear cached token");
        }
    }
}

/// Reads the local cache file.
pub struct CachedToken {
    cache: Arc<TokenCache>,
}

impl CachedToken {
    pub fn new(cache: Arc<TokenCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl TokenStrategy for CachedToken {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn resolve(&self, _browser: &dyn BrowserSession) -> Result<Option<BearerToken>> {
        Ok(self.cache.load_cached_token())
    }
}

/// Scans storage the browser profile persisted, across origins.
pub struct PersistedStorage;

#[async_trait]
impl TokenStrategy for PersistedStorage {
    fn name(&self) -> &'static str {
        "persisted-storage"
    }

    async fn resolve(&self, browser: &dyn BrowserSession) -> Result<Option<BearerToken>> {
        let snapshot = browser.storage_snapshot().await?;
        Ok(token_from_entries(snapshot.entries())
            .map(|value| BearerToken::new(value, TokenSource::Storage)))
    }
}

/// Scans the current page's localStorage and sessionStorage.
pub struct LiveStorage;

#[async_trait]
impl TokenStrategy for LiveStorage {
    fn name(&self) -> &'static str {
        "live-storage"
    }

    async fn resolve(&self, browser: &dyn BrowserSession) -> Result<Option<BearerToken>> {
        let entries = browser.live_storage().await?;
        Ok(token_from_entries(entries.iter())
            .map(|value| BearerToken::new(value, TokenSource::Storage)))
    }
}

/// Intercepts the dashboard's API requests and reads their bearer header.
pub struct NetworkCapture {
    dashboard_url: String,
    pattern: String,
    timeout: Duration,
    settle: Duration,
}

impl NetworkCapture {
    pub fn new(portal: &PortalConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            dashboard_url: portal.dashboard_url.clone(),
            pattern: API_REQUEST_PATTERN.to_string(),
            timeout: timeouts.capture_timeout,
            settle: timeouts.capture_settle,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    async fn drive(
        &self,
        browser: &dyn BrowserSession,
        observer: &dyn AuthorizationObserver,
    ) -> Option<String> {
        if let Err(e) = browser.goto(&self.dashboard_url).await {
            tracing::debug!(error = %e, "Dashboard navigation failed, reloading instead");
            if let Err(e) = browser.reload().await {
                tracing::debug!(error = %e, "Reload failed");
            }
        }
        if let Some(token) = wait_for_capture(observer, self.settle).await {
            return Some(token);
        }

        tracing::debug!("No API request seen yet, reloading");
        if let Err(e) = browser.reload().await {
            tracing::debug!(error = %e, "Reload failed");
        }
        wait_for_capture(observer, self.settle).await
    }
}

#[async_trait]
impl TokenStrategy for NetworkCapture {
    fn name(&self) -> &'static str {
        "network-capture"
    }

    async fn resolve(&self, browser: &dyn BrowserSession) -> Result<Option<BearerToken>> {
        let observer = browser.observe_authorization(&self.pattern).await?;
        let captured = tokio::time::timeout(self.timeout, self.drive(browser, observer.as_ref())).await;
        if let Err(e) = observer.detach().await {
            tracing::debug!(error = %e, "Failed to detach request observer");
        }

        match captured {
            Ok(token) => Ok(token.map(|value| BearerToken::new(value, TokenSource::Intercepted))),
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "Timed out capturing bearer token");
                Ok(None)
            }
        }
    }
}

async fn wait_for_capture(observer: &dyn AuthorizationObserver, window: Duration) -> Option<String> {
    let poll = Duration::from_millis(250);
    let deadline = tokio::time::Instant::now() + window;
    loop {
        if let Some(token) = observer.captured().await {
            return Some(token);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(poll).await;
    }
}

fn opaque_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{20,}$").expect("valid token regex"))
}

/// Pull a bearer token out of a storage entry, if it looks like it holds one.
///
/// Candidates are entries whose value mentions `Bearer` or whose key mentions
/// `token`/`auth`. Accepted shapes:
///
/// - a JSON object with an `access_token` or `token` string;
/// - a JSON string `"Bearer <token>"`;
/// - a bare (non-JSON) value of at least 20 URL-safe characters.
pub fn token_from_entry(entry: &StorageEntry) -> Option<String> {
    let key = entry.key.to_lowercase();
    let value = entry.value.trim();
    if !(value.contains("Bearer") || key.contains("token") || key.contains("auth")) {
        return None;
    }

    match serde_json::from_str::<serde_json::Value>(value) {
        Ok(serde_json::Value::Object(map)) => ["access_token", "token"]
            .iter()
            .filter_map(|k| map.get(*k).and_then(|v| v.as_str()))
            .map(str::trim)
            .find(|t| !t.is_empty())
            .map(str::to_string),
        Ok(serde_json::Value::String(s)) => crate::browser::bearer_value(&s).map(str::to_string),
        Ok(_) => None,
        Err(_) => opaque_token_re()
            .is_match(value)
            .then(|| value.to_string()),
    }
}

/// First token found among `entries`, in order.
pub fn token_from_entries<'a>(entries: impl IntoIterator<Item = &'a StorageEntry>) -> Option<String> {
    entries.into_iter().find_map(token_from_entry)
}
