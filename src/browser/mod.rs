//! Browser control surface.
//!
//! Login and token capture drive a real browser. Everything above this
//! module talks to [`BrowserSession`] only, so tests can script a fake and
//! the chromiumoxide backend stays optional.

#[cfg(feature = "browser")]
pub mod chrome;

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// One key/value pair from localStorage or sessionStorage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub key: String,
    pub value: String,
}

impl StorageEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Persisted storage for a single origin.
#[derive(Debug, Clone, Default)]
pub struct OriginStorage {
    pub origin: String,
    pub entries: Vec<StorageEntry>,
}

/// Storage persisted by the browser profile, across all known origins.
#[derive(Debug, Clone, Default)]
pub struct StorageSnapshot {
    pub origins: Vec<OriginStorage>,
}

impl StorageSnapshot {
    pub fn entries(&self) -> impl Iterator<Item = &StorageEntry> {
        self.origins.iter().flat_map(|o| o.entries.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
}

impl BrowserCookie {
    /// Whether the cookie would be sent to `host`.
    pub fn matches_host(&self, host: &str) -> bool {
        let domain = self.domain.trim_start_matches('.');
        !domain.is_empty() && (host == domain || host.ends_with(&format!(".{domain}")))
    }
}

/// Watches outgoing requests for an `Authorization: Bearer` header.
#[async_trait]
pub trait AuthorizationObserver: Send + Sync {
    /// First bearer value seen so far, without the `Bearer ` prefix.
    async fn captured(&self) -> Option<String>;

    /// Stop intercepting. Requests are no longer paused afterwards.
    async fn detach(self: Box<Self>) -> Result<()>;
}

/// The capabilities login, token resolution and scraping need from a browser.
///
/// Selectors are CSS selectors. Methods return `Err` for transport failures;
/// "element not there" is `Ok(false)` / `Ok(None)` / an empty list.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;
    async fn reload(&self) -> Result<()>;
    async fn current_url(&self) -> Result<String>;
    async fn title(&self) -> Result<String>;
    async fn content(&self) -> Result<String>;

    async fn is_visible(&self, selector: &str) -> Result<bool>;

    /// Visible text of every element matching `selector`, in document order.
    async fn texts(&self, selector: &str) -> Result<Vec<String>>;

    async fn fill(&self, selector: &str, value: &str) -> Result<()>;
    async fn click(&self, selector: &str) -> Result<()>;

    /// Click the first element matching `selector` whose text contains
    /// `text`. Returns `false` if there is none.
    async fn click_text(&self, selector: &str, text: &str) -> Result<bool>;

    /// Send a key press (`"ArrowDown"`, `"Enter"`) to the element.
    async fn press(&self, selector: &str, key: &str) -> Result<()>;

    /// Evaluate a JavaScript expression in the page and return its JSON value.
    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value>;

    /// localStorage persisted by the profile, across origins.
    async fn storage_snapshot(&self) -> Result<StorageSnapshot>;

    /// localStorage and sessionStorage of the current page.
    async fn live_storage(&self) -> Result<Vec<StorageEntry>>;

    async fn cookies(&self) -> Result<Vec<BrowserCookie>>;

    /// Start intercepting requests whose URL matches `url_pattern`
    /// (`*` wildcards).
    async fn observe_authorization(&self, url_pattern: &str)
        -> Result<Box<dyn AuthorizationObserver>>;

    /// Save files the page downloads into `dir`, under the names the
    /// server suggests. Partial files carry a `.crdownload` suffix.
    async fn set_download_dir(&self, dir: &Path) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Poll until `selector` is visible or `timeout` elapses.
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool> {
        let poll = Duration::from_millis(250);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_visible(selector).await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Text of the first element matching `selector`.
    async fn text(&self, selector: &str) -> Result<Option<String>> {
        Ok(self.texts(selector).await?.into_iter().next())
    }
}

/// Strip a `Bearer ` prefix from an `Authorization` header value.
pub fn bearer_value(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
