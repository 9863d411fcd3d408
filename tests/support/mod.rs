#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use elbakit::auth::ApprovalNotifier;
use elbakit::browser::{
    AuthorizationObserver, BrowserCookie, BrowserSession, OriginStorage, StorageEntry,
    StorageSnapshot,
};
use elbakit::config::{Config, PortalConfig, ResolvedConfig, TimeoutConfig};
use elbakit::credentials::{CredentialConfig, EnvFileStore};
use serde_json::{json, Value};

pub const LOGIN_URL: &str = "https://sso.raiffeisen.at/mein-login/identify";
pub const DASHBOARD_URL: &str =
    "https://mein.elba.raiffeisen.at/bankingws-widgetsystem/meine-produkte/dashboard";
pub const DOCUMENTS_URL: &str =
    "https://mein.elba.raiffeisen.at/bankingws-widgetsystem/mailbox/dokumente";

pub const REGION_DROPDOWN: &str = r#"rds-select[formcontrolname="mandant"]"#;
pub const REGION_OPTION: &str = "rds-option";
pub const SUBMIT_ENABLED: &str = r#"button[type="submit"]:not([disabled])"#;
pub const APPROVAL_CODE: &str = "p.rds-display-1";
pub const ERROR_BOX: &str = "div#error_message";
pub const PRODUCT_CARD: &str = "banking-product-card";
pub const DOCUMENT_ROW: &str = "rds-list-item-row";

/// An identifier with a known region prefix (Lower Austria).
pub const IDENTIFIER: &str = "ELVIE32V12345678";
pub const PIN: &str = "24680";

/// Page change applied when the login form is submitted.
#[derive(Debug, Clone, Default)]
pub struct Transition {
    pub url: Option<String>,
    pub content: Option<String>,
    pub show: Vec<String>,
    pub texts: Vec<(String, Vec<String>)>,
    pub clear_redirects: bool,
}

impl Transition {
    /// The portal shows an approval code and later lands on the dashboard.
    pub fn approved(code: &str) -> Self {
        Self {
            url: Some(DASHBOARD_URL.to_string()),
            content: Some("<html>dashboard</html>".to_string()),
            show: vec![APPROVAL_CODE.to_string(), PRODUCT_CARD.to_string()],
            texts: vec![(APPROVAL_CODE.to_string(), vec![code.to_string()])],
            clear_redirects: true,
        }
    }

    /// The approval code stays on screen and nothing else happens.
    pub fn pending(code: &str) -> Self {
        Self {
            url: None,
            content: None,
            show: vec![APPROVAL_CODE.to_string()],
            texts: vec![(APPROVAL_CODE.to_string(), vec![code.to_string()])],
            clear_redirects: false,
        }
    }

    pub fn content(content: &str) -> Self {
        Self {
            content: Some(content.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    url: String,
    title: String,
    content: String,
    visible: HashSet<String>,
    texts: HashMap<String, Vec<String>>,
    redirects: HashMap<String, String>,
    on_submit: Option<Transition>,
    persisted: Vec<StorageEntry>,
    live: Vec<StorageEntry>,
    cookies: Vec<BrowserCookie>,
    capture_on_navigation: Option<String>,
    observing: bool,
    captured: Option<String>,
    hang_navigation: bool,
    storage_refresh: HashMap<String, StorageEntry>,
    scans: VecDeque<Value>,
    last_scan: Value,
    gotos: Vec<String>,
    clicks: Vec<String>,
    fills: Vec<(String, String)>,
    presses: Vec<(String, String)>,
    on_click: HashMap<String, Transition>,
    failing_navigation: HashSet<String>,
    download_dir: Option<PathBuf>,
    download_names: VecDeque<String>,
    observers: usize,
    detached: usize,
    closed: bool,
}

struct Inner {
    state: Mutex<FakeState>,
    calls: AtomicUsize,
}

impl Inner {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake browser state poisoned")
    }
}

/// Scriptable in-memory [`BrowserSession`].
///
/// Pages are modelled by a URL, text content, and a set of visible
/// selectors. `goto` follows configured redirects, clicking the submit
/// button applies the configured [`Transition`], and request interception
/// "sees" the configured bearer token on the next navigation.
#[derive(Clone)]
pub struct FakeBrowser {
    inner: Arc<Inner>,
}

impl FakeBrowser {
    pub fn at(url: &str) -> Self {
        let state = FakeState {
            url: url.to_string(),
            last_scan: json!([]),
            ..FakeState::default()
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                calls: AtomicUsize::new(0),
            }),
        }
    }

    /// A browser whose profile still holds a logged-in session.
    pub fn logged_in() -> Self {
        Self::at(DASHBOARD_URL)
            .with_redirect(LOGIN_URL, DASHBOARD_URL)
            .with_visible(PRODUCT_CARD)
    }

    /// A fresh profile: the dashboard bounces to the login form.
    pub fn login_form() -> Self {
        Self::at("about:blank")
            .with_redirect(DASHBOARD_URL, LOGIN_URL)
            .with_visible(REGION_DROPDOWN)
            .with_visible(SUBMIT_ENABLED)
            .with_texts(
                REGION_OPTION,
                &["Raiffeisen Burgenland", "Raiffeisen Lower Austria", "Raiffeisen Tyrol"],
            )
    }

    fn edit(self, f: impl FnOnce(&mut FakeState)) -> Self {
        f(&mut self.inner.state());
        self
    }

    pub fn with_title(self, title: &str) -> Self {
        self.edit(|s| s.title = title.to_string())
    }

    pub fn with_content(self, content: &str) -> Self {
        self.edit(|s| s.content = content.to_string())
    }

    pub fn with_visible(self, selector: &str) -> Self {
        self.edit(|s| {
            s.visible.insert(selector.to_string());
        })
    }

    pub fn with_texts(self, selector: &str, texts: &[&str]) -> Self {
        self.edit(|s| {
            s.texts.insert(
                selector.to_string(),
                texts.iter().map(|t| t.to_string()).collect(),
            );
        })
    }

    pub fn with_redirect(self, from: &str, to: &str) -> Self {
        self.edit(|s| {
            s.redirects.insert(from.to_string(), to.to_string());
        })
    }

    pub fn on_submit(self, transition: Transition) -> Self {
        self.edit(|s| s.on_submit = Some(transition))
    }

    /// Clicking the element whose text contains `text` applies `transition`.
    pub fn on_click(self, text: &str, transition: Transition) -> Self {
        self.edit(|s| {
            s.on_click.insert(text.to_string(), transition);
        })
    }

    /// Navigating to `url` fails with an error.
    pub fn failing_navigation_to(self, url: &str) -> Self {
        self.edit(|s| {
            s.failing_navigation.insert(url.to_string());
        })
    }

    /// File names the server suggests for successive downloads. Once used
    /// up, downloads are named after the button label.
    pub fn with_download_names(self, names: &[&str]) -> Self {
        self.edit(|s| s.download_names = names.iter().map(|n| n.to_string()).collect())
    }

    pub fn with_persisted(self, key: &str, value: &str) -> Self {
        self.edit(|s| s.persisted.push(StorageEntry::new(key, value)))
    }

    pub fn with_live(self, key: &str, value: &str) -> Self {
        self.edit(|s| s.live.push(StorageEntry::new(key, value)))
    }

    pub fn with_cookie(self, name: &str, value: &str, domain: &str) -> Self {
        self.edit(|s| {
            s.cookies.push(BrowserCookie {
                name: name.to_string(),
                value: value.to_string(),
                domain: domain.to_string(),
            })
        })
    }

    /// Requests made after the next navigation carry this bearer token.
    pub fn with_capture(self, token: &str) -> Self {
        self.edit(|s| s.capture_on_navigation = Some(token.to_string()))
    }

    /// Visiting `url` makes the app store a new token, as a fresh login would.
    pub fn refresh_storage_on(self, url: &str, key: &str, value: &str) -> Self {
        self.edit(|s| {
            s.storage_refresh
                .insert(url.to_string(), StorageEntry::new(key, value));
        })
    }

    /// Navigation never finishes.
    pub fn with_hanging_navigation(self) -> Self {
        self.edit(|s| s.hang_navigation = true)
    }

    /// Results of successive scans of the document list. The last one repeats.
    pub fn with_scans(self, scans: Vec<Value>) -> Self {
        self.edit(|s| s.scans = scans.into())
    }

    /// Replace persisted storage, e.g. after the app refreshed its token.
    pub fn set_persisted(&self, key: &str, value: &str) {
        let mut s = self.inner.state();
        s.persisted = vec![StorageEntry::new(key, value)];
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn gotos(&self) -> Vec<String> {
        self.inner.state().gotos.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.inner.state().clicks.clone()
    }

    pub fn fills(&self) -> Vec<(String, String)> {
        self.inner.state().fills.clone()
    }

    pub fn presses(&self) -> Vec<(String, String)> {
        self.inner.state().presses.clone()
    }

    pub fn download_dir(&self) -> Option<PathBuf> {
        self.inner.state().download_dir.clone()
    }

    pub fn observers(&self) -> usize {
        self.inner.state().observers
    }

    pub fn detached(&self) -> usize {
        self.inner.state().detached
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    fn hit(&self) {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn navigate(&self, url: Option<&str>) {
        let hang = {
            let mut s = self.inner.state();
            if let Some(url) = url {
                s.gotos.push(url.to_string());
                if let Some(entry) = s.storage_refresh.get(url).cloned() {
                    s.persisted = vec![entry];
                }
                let target = s.redirects.get(url).cloned().unwrap_or_else(|| url.to_string());
                s.url = target;
            }
            if s.observing {
                if let Some(token) = s.capture_on_navigation.clone() {
                    s.captured = Some(token);
                }
            }
            s.hang_navigation
        };
        if hang {
            std::future::pending::<()>().await;
        }
    }

    fn submit(&self) {
        let mut s = self.inner.state();
        if let Some(transition) = s.on_submit.take() {
            apply(&mut s, transition);
        }
    }

    /// Save a file as Chrome would for a download button click.
    fn download(&self, selector: &str) -> Result<()> {
        let mut s = self.inner.state();
        let Some(dir) = s.download_dir.clone() else {
            anyhow::bail!("download clicked without a download dir");
        };
        let name = s.download_names.pop_front().unwrap_or_else(|| {
            let label = selector
                .split(r#"aria-label=""#)
                .nth(1)
                .and_then(|rest| rest.split('"').next())
                .unwrap_or("document");
            format!("{label}.pdf")
        });
        std::fs::write(dir.join(name), b"%PDF-1.4\n")?;
        Ok(())
    }
}

fn apply(s: &mut FakeState, transition: Transition) {
    if transition.clear_redirects {
        s.redirects.clear();
    }
    if let Some(url) = transition.url {
        s.url = url;
    }
    if let Some(content) = transition.content {
        s.content = content;
    }
    for selector in transition.show {
        s.visible.insert(selector);
    }
    for (selector, texts) in transition.texts {
        s.texts.insert(selector, texts);
    }
}

struct FakeObserver {
    inner: Arc<Inner>,
}

#[async_trait]
impl AuthorizationObserver for FakeObserver {
    async fn captured(&self) -> Option<String> {
        self.inner.state().captured.clone()
    }

    async fn detach(self: Box<Self>) -> Result<()> {
        let mut s = self.inner.state();
        s.observing = false;
        s.detached += 1;
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for FakeBrowser {
    async fn goto(&self, url: &str) -> Result<()> {
        self.hit();
        if self.inner.state().failing_navigation.contains(url) {
            self.inner.state().gotos.push(url.to_string());
            anyhow::bail!("net::ERR_CONNECTION_RESET at {url}");
        }
        self.navigate(Some(url)).await;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.hit();
        self.navigate(None).await;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        self.hit();
        Ok(self.inner.state().url.clone())
    }

    async fn title(&self) -> Result<String> {
        self.hit();
        Ok(self.inner.state().title.clone())
    }

    async fn content(&self) -> Result<String> {
        self.hit();
        Ok(self.inner.state().content.clone())
    }

    async fn is_visible(&self, selector: &str) -> Result<bool> {
        self.hit();
        Ok(self.inner.state().visible.contains(selector))
    }

    async fn texts(&self, selector: &str) -> Result<Vec<String>> {
        self.hit();
        Ok(self
            .inner
            .state()
            .texts
            .get(selector)
            .cloned()
            .unwrap_or_default())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<()> {
        self.hit();
        self.inner
            .state()
            .fills
            .push((selector.to_string(), value.to_string()));
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.hit();
        self.inner.state().clicks.push(selector.to_string());
        if selector.contains(r#"type="submit""#) {
            self.submit();
        }
        if selector.contains(r#"icon="download""#) {
            self.download(selector)?;
        }
        Ok(())
    }

    async fn click_text(&self, selector: &str, text: &str) -> Result<bool> {
        self.hit();
        let mut s = self.inner.state();
        let found = s
            .texts
            .get(selector)
            .is_some_and(|texts| texts.iter().any(|t| t.contains(text)));
        if found {
            s.clicks.push(format!("{selector}:{text}"));
            let key = s
                .on_click
                .keys()
                .find(|key| text.contains(key.as_str()))
                .cloned();
            if let Some(transition) = key.and_then(|key| s.on_click.remove(&key)) {
                apply(&mut s, transition);
            }
        }
        Ok(found)
    }

    async fn press(&self, selector: &str, key: &str) -> Result<()> {
        self.hit();
        self.inner
            .state()
            .presses
            .push((selector.to_string(), key.to_string()));
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.hit();
        if expression.contains("scrollBy") {
            return Ok(Value::Bool(true));
        }
        let mut s = self.inner.state();
        if let Some(next) = s.scans.pop_front() {
            s.last_scan = next;
        }
        Ok(s.last_scan.clone())
    }

    async fn storage_snapshot(&self) -> Result<StorageSnapshot> {
        self.hit();
        let entries = self.inner.state().persisted.clone();
        Ok(StorageSnapshot {
            origins: vec![OriginStorage {
                origin: "https://mein.elba.raiffeisen.at".to_string(),
                entries,
            }],
        })
    }

    async fn live_storage(&self) -> Result<Vec<StorageEntry>> {
        self.hit();
        Ok(self.inner.state().live.clone())
    }

    async fn cookies(&self) -> Result<Vec<BrowserCookie>> {
        self.hit();
        Ok(self.inner.state().cookies.clone())
    }

    async fn observe_authorization(
        &self,
        _url_pattern: &str,
    ) -> Result<Box<dyn AuthorizationObserver>> {
        self.hit();
        let mut s = self.inner.state();
        s.observing = true;
        s.observers += 1;
        Ok(Box::new(FakeObserver {
            inner: self.inner.clone(),
        }))
    }

    async fn set_download_dir(&self, dir: &Path) -> Result<()> {
        self.hit();
        std::fs::create_dir_all(dir)?;
        self.inner.state().download_dir = Some(dir.to_path_buf());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.hit();
        self.inner.state().closed = true;
        Ok(())
    }
}

/// Collects approval codes instead of printing them.
#[derive(Default)]
pub struct RecordingNotifier {
    codes: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn codes(&self) -> Vec<String> {
        self.codes.lock().expect("notifier poisoned").clone()
    }
}

impl ApprovalNotifier for RecordingNotifier {
    fn notify(&self, code: &str) {
        self.codes.lock().expect("notifier poisoned").push(code.to_string());
    }
}

/// Timeouts short enough for tests on a real clock.
pub fn fast_timeouts() -> TimeoutConfig {
    let ms = Duration::from_millis;
    TimeoutConfig {
        page_settle: ms(1),
        login_element: ms(20),
        approval_poll: ms(5),
        approval_timeout: ms(200),
        capture_timeout: ms(200),
        capture_settle: ms(20),
        request: Duration::from_secs(5),
        reveal_settle: ms(1),
        download: ms(500),
    }
}

pub fn portal(api_base: &str) -> PortalConfig {
    PortalConfig {
        api_base: api_base.to_string(),
        ..PortalConfig::default()
    }
}

/// Config rooted in `data_dir`, with fast timeouts and the API at `api_base`.
pub fn test_config(data_dir: &Path, api_base: &str) -> ResolvedConfig {
    let config = Config {
        data_dir: Some(data_dir.to_path_buf()),
        timeouts: fast_timeouts(),
        portal: portal(api_base),
        credentials: Some(CredentialConfig::File {
            path: data_dir.join(".env"),
        }),
        ..Config::default()
    };
    ResolvedConfig::from_config(config, data_dir)
}

/// Write a usable identifier/PIN pair to the config's credential file.
pub fn write_credentials(config: &ResolvedConfig) -> Result<()> {
    let CredentialConfig::File { path } = &config.credentials else {
        anyhow::bail!("test config must use the file backend");
    };
    std::fs::write(path, format!("ELBA_ID={IDENTIFIER}\nELBA_PIN={PIN}\n"))?;
    Ok(())
}

pub fn credential_store(config: &ResolvedConfig) -> EnvFileStore {
    match &config.credentials {
        CredentialConfig::File { path } => EnvFileStore::new(path.clone()),
        CredentialConfig::Env { .. } => EnvFileStore::new(config.data_dir.join(".env")),
    }
}

/// A document list row as the scan script returns it.
pub fn document_row(n: usize) -> Value {
    json!({
        "account": "AT61 1904 3002 3457 3201",
        "date": format!("{:02}.05.2024", n % 28 + 1),
        "name": format!("Kontoauszug {n}"),
        "label": format!("Download Kontoauszug {n}"),
    })
}
