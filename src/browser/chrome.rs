//! chromiumoxide-backed [`BrowserSession`].

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromeConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::dom_storage::{self, GetDomStorageItemsParams, StorageId};
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, EventRequestPaused, RequestPattern, RequestStage,
};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{
    bearer_value, AuthorizationObserver, BrowserCookie, BrowserSession, OriginStorage,
    StorageEntry, StorageSnapshot,
};
use crate::config::{BrowserConfig, PortalConfig};

/// A running Chrome instance with a single page.
pub struct ChromeSession {
    browser: Mutex<Option<Browser>>,
    page: Page,
    handler_task: JoinHandle<()>,
    origins: Vec<String>,
}

impl ChromeSession {
    /// Launch Chrome on the persistent profile in `profile_dir`.
    pub async fn launch(
        config: &BrowserConfig,
        profile_dir: &Path,
        portal: &PortalConfig,
    ) -> Result<Self> {
        let chrome_path = match &config.chrome_executable {
            Some(path) => path.display().to_string(),
            None => find_chrome().context(
                "Chrome/Chromium not found. Install Chrome or set browser.chrome_executable.",
            )?,
        };
        std::fs::create_dir_all(profile_dir)
            .with_context(|| format!("Failed to create profile dir: {}", profile_dir.display()))?;

        let mut builder = ChromeConfig::builder()
            .chrome_executable(chrome_path)
            .viewport(None)
            .user_data_dir(profile_dir)
            .arg(format!(
                "--window-size={},{}",
                config.window_width, config.window_height
            ))
            .arg(format!("--user-agent={}", portal.user_agent))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        if !config.headless {
            builder = builder.with_head();
        }
        let chrome_config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to configure browser: {e}"))?;

        let (browser, mut handler) = Browser::launch(chrome_config)
            .await
            .context("Failed to launch browser")?;
        let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                handler_task.abort();
                return Err(e).context("Failed to open browser page");
            }
        };

        let origins = [&portal.dashboard_url, &portal.login_url]
            .iter()
            .filter_map(|u| reqwest::Url::parse(u).ok())
            .map(|u| u.origin().ascii_serialization())
            .collect();

        tracing::debug!(profile = %profile_dir.display(), headless = config.headless, "Browser launched");

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            page,
            handler_task,
            origins,
        })
    }

    async fn eval_as<T: serde::de::DeserializeOwned>(&self, expression: &str) -> Result<T> {
        let value = self.evaluate(expression).await?;
        serde_json::from_value(value).context("Unexpected value from page script")
    }

    async fn origin_storage(&self, origin: &str) -> Result<Vec<StorageEntry>> {
        let storage_id = StorageId::builder()
            .security_origin(origin)
            .is_local_storage(true)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build storage id: {e}"))?;
        let response = self
            .page
            .execute(GetDomStorageItemsParams::new(storage_id))
            .await?;
        Ok(response
            .result
            .entries
            .iter()
            .filter_map(|item| match item.inner().as_slice() {
                [key, value, ..] => Some(StorageEntry::new(key.clone(), value.clone())),
                _ => None,
            })
            .collect())
    }
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn goto(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .with_context(|| format!("Navigation to {url} failed"))?;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.page.reload().await.context("Reload failed")?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn title(&self) -> Result<String> {
        Ok(self.page.get_title().await?.unwrap_or_default())
    }

    async fn content(&self) -> Result<String> {
        Ok(self.page.content().await?)
    }

    async fn is_visible(&self, selector: &str) -> Result<bool> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                const r = el.getBoundingClientRect();
                const s = window.getComputedStyle(el);
                return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none';
            }})()"#,
            sel = js_string(selector)
        );
        self.eval_as(&script).await
    }

    async fn texts(&self, selector: &str) -> Result<Vec<String>> {
        let script = format!(
            "Array.from(document.querySelectorAll({sel})).map(e => (e.innerText || '').trim())",
            sel = js_string(selector)
        );
        self.eval_as(&script).await
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<()> {
        let clear = format!(
            "(() => {{ const el = document.querySelector({sel}); if (el) el.value = ''; }})()",
            sel = js_string(selector)
        );
        self.evaluate(&clear).await?;
        self.page
            .find_element(selector)
            .await
            .with_context(|| format!("Element not found: {selector}"))?
            .click()
            .await?
            .type_str(value)
            .await?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.page
            .find_element(selector)
            .await
            .with_context(|| format!("Element not found: {selector}"))?
            .click()
            .await?;
        Ok(())
    }

    async fn click_text(&self, selector: &str, text: &str) -> Result<bool> {
        let script = format!(
            r#"(() => {{
                const el = Array.from(document.querySelectorAll({sel}))
                    .find(e => (e.innerText || '').includes({text}));
                if (!el) return false;
                el.scrollIntoView({{block: 'center'}});
                el.click();
                return true;
            }})()"#,
            sel = js_string(selector),
            text = js_string(text)
        );
        self.eval_as(&script).await
    }

    async fn press(&self, selector: &str, key: &str) -> Result<()> {
        self.page
            .find_element(selector)
            .await
            .with_context(|| format!("Element not found: {selector}"))?
            .press_key(key)
            .await?;
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value> {
        let result = self.page.evaluate(expression).await?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn storage_snapshot(&self) -> Result<StorageSnapshot> {
        self.page
            .execute(dom_storage::EnableParams::default())
            .await?;
        let mut snapshot = StorageSnapshot::default();
        for origin in &self.origins {
            match self.origin_storage(origin).await {
                Ok(entries) => snapshot.origins.push(OriginStorage {
                    origin: origin.clone(),
                    entries,
                }),
                Err(e) => tracing::debug!(origin, error = %e, "No storage for origin"),
            }
        }
        Ok(snapshot)
    }

    async fn live_storage(&self) -> Result<Vec<StorageEntry>> {
        let script = r#"(() => {
            const out = [];
            for (const store of [window.localStorage, window.sessionStorage]) {
                try {
                    for (let i = 0; i < store.length; i++) {
                        const k = store.key(i);
                        out.push([k, store.getItem(k) || '']);
                    }
                } catch (e) {}
            }
            return out;
        })()"#;
        let pairs: Vec<(String, String)> = self.eval_as(script).await?;
        Ok(pairs
            .into_iter()
            .map(|(key, value)| StorageEntry { key, value })
            .collect())
    }

    async fn cookies(&self) -> Result<Vec<BrowserCookie>> {
        let cookies = self.page.get_cookies().await?;
        Ok(cookies
            .into_iter()
            .map(|c| BrowserCookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
            })
            .collect())
    }

    async fn observe_authorization(
        &self,
        url_pattern: &str,
    ) -> Result<Box<dyn AuthorizationObserver>> {
        let captured: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let token_clone = captured.clone();

        let patterns = vec![RequestPattern {
            url_pattern: Some(url_pattern.to_string()),
            resource_type: None,
            request_stage: Some(RequestStage::Request),
        }];
        self.page
            .execute(fetch::EnableParams {
                patterns: Some(patterns),
                handle_auth_requests: None,
            })
            .await?;

        let mut request_events = self.page.event_listener::<EventRequestPaused>().await?;
        let page = self.page.clone();
        let intercept_task = tokio::spawn(async move {
            while let Some(event) = request_events.next().await {
                let headers = event.request.headers.inner();
                if let Some(headers_obj) = headers.as_object() {
                    let auth = headers_obj
                        .get("authorization")
                        .or_else(|| headers_obj.get("Authorization"))
                        .and_then(|v| v.as_str());
                    if let Some(token) = auth.and_then(bearer_value) {
                        let mut guard = token_clone.lock().await;
                        if guard.is_none() {
                            *guard = Some(token.to_string());
                        }
                    }
                }

                let _ = page
                    .execute(fetch::ContinueRequestParams {
                        request_id: event.request_id.clone(),
                        url: None,
                        method: None,
                        post_data: None,
                        headers: None,
                        intercept_response: None,
                    })
                    .await;
            }
        });

        Ok(Box::new(ChromeObserver {
            page: self.page.clone(),
            captured,
            intercept_task,
        }))
    }

    async fn set_download_dir(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create download dir: {}", dir.display()))?;
        let params = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(dir.display().to_string())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build download params: {e}"))?;
        self.page.execute(params).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut browser) = self.browser.lock().await.take() {
            if let Err(e) = browser.close().await {
                tracing::debug!(error = %e, "Browser close failed");
            }
            let _ = browser.wait().await;
        }
        self.handler_task.abort();
        Ok(())
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

struct ChromeObserver {
    page: Page,
    captured: Arc<Mutex<Option<String>>>,
    intercept_task: JoinHandle<()>,
}

#[async_trait]
impl AuthorizationObserver for ChromeObserver {
    async fn captured(&self) -> Option<String> {
        self.captured.lock().await.clone()
    }

    async fn detach(self: Box<Self>) -> Result<()> {
        self.intercept_task.abort();
        self.page.execute(fetch::DisableParams::default()).await?;
        Ok(())
    }
}

/// Find Chrome/Chromium executable.
fn find_chrome() -> Option<String> {
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(output) = std::process::Command::new("which").arg(name).output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Some(path);
                }
            }
        }
    }

    let candidates = [
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        // NixOS
        "/run/current-system/sw/bin/google-chrome",
        "/run/current-system/sw/bin/chromium",
        // macOS
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ];

    candidates
        .into_iter()
        .find(|c| Path::new(c).exists())
        .map(str::to_string)
}
