//! Session orchestration.
//!
//! [`SessionOrchestrator`] is the entry point for everything that needs an
//! authenticated portal session. It makes sure the browser is logged in,
//! finds a bearer token, runs the operation, and when the server rejects
//! the token it re-authenticates and retries the operation exactly once.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use serde_json::Value;

use crate::api::{AuthContext, PagedEndpoint, PortalClient};
use crate::auth::{ApprovalNotifier, Authenticator, LoginFailure, TokenResolver};
use crate::browser::BrowserSession;
use crate::collect::{Collected, Collector, Revealer};
use crate::config::ResolvedConfig;
use crate::credentials::{load_credential, BearerToken, Credential, CredentialStore, TokenCache};
use crate::debug::DebugDumper;
use crate::error::SessionError;
use crate::scrape::{DocumentQuery, DocumentRevealer, DocumentRow};

pub struct SessionOrchestrator {
    config: ResolvedConfig,
    credentials: Box<dyn CredentialStore>,
    resolver: TokenResolver,
    authenticator: Authenticator,
    client: PortalClient,
    browser: Arc<dyn BrowserSession>,
    authenticated: AtomicBool,
    last_failure: Mutex<Option<LoginFailure>>,
}

impl SessionOrchestrator {
    pub fn new(
        config: ResolvedConfig,
        credentials: Box<dyn CredentialStore>,
        token_cache: Arc<TokenCache>,
        browser: Arc<dyn BrowserSession>,
    ) -> anyhow::Result<Self> {
        let mut client = PortalClient::new(&config.portal, &config.timeouts)?;
        if config.debug {
            client = client.with_debug(Arc::new(DebugDumper::new(&config.debug_dir)));
        }
        let resolver = TokenResolver::standard(token_cache.clone(), &config);
        let authenticator = Authenticator::new(config.portal.clone(), config.timeouts.clone())
            .with_cache(token_cache);

        Ok(Self {
            config,
            credentials,
            resolver,
            authenticator,
            client,
            browser,
            authenticated: AtomicBool::new(false),
            last_failure: Mutex::new(None),
        })
    }

    /// Replace the token strategy chain.
    pub fn with_resolver(mut self, resolver: TokenResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ApprovalNotifier>) -> Self {
        self.authenticator = self.authenticator.with_notifier(notifier);
        self
    }

    pub fn client(&self) -> &PortalClient {
        &self.client
    }

    pub fn browser(&self) -> &Arc<dyn BrowserSession> {
        &self.browser
    }

    /// Typed reason the most recent login attempt failed.
    pub fn last_failure(&self) -> Option<LoginFailure> {
        self.last_failure.lock().ok().and_then(|g| g.clone())
    }

    fn set_last_failure(&self, failure: Option<LoginFailure>) {
        if let Ok(mut guard) = self.last_failure.lock() {
            *guard = failure;
        }
    }

    async fn credential(&self) -> Result<Credential, SessionError> {
        load_credential(self.credentials.as_ref())
            .await?
            .ok_or_else(|| {
                SessionError::Configuration(format!(
                    "Credentials not found in {}. Run `elbakit setup` first.",
                    self.config.credentials.describe()
                ))
            })
    }

    async fn login(&self) -> Result<(), SessionError> {
        let credential = self.credential().await?;
        let report = self.authenticator.run(self.browser.as_ref(), &credential).await;
        if report.is_success() {
            // Anything cached predates this login.
            self.resolver.invalidate();
            self.authenticated.store(true, Ordering::SeqCst);
            self.set_last_failure(None);
            return Ok(());
        }

        self.authenticated.store(false, Ordering::SeqCst);
        let failure = report
            .failure()
            .cloned()
            .unwrap_or_else(|| LoginFailure::Browser("login ended without an outcome".into()));
        self.set_last_failure(Some(failure.clone()));
        Err(failure.into())
    }

    /// Run the login flow. The typed failure is kept in [`Self::last_failure`].
    pub async fn authenticate(&self) -> bool {
        match self.login().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Authentication failed");
                false
            }
        }
    }

    /// Make sure the browser holds a logged-in session.
    async fn ensure_session(&self) -> Result<(), SessionError> {
        if self.authenticated.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.browser.goto(&self.config.portal.dashboard_url).await {
            tracing::debug!(error = %e, "Dashboard navigation failed");
        }
        tokio::time::sleep(self.config.timeouts.page_settle).await;
        let url = self.browser.current_url().await.unwrap_or_default();
        if self.config.portal.is_authenticated_url(&url) {
            tracing::info!("Reusing existing browser session");
            self.authenticated.store(true, Ordering::SeqCst);
            return Ok(());
        }

        tracing::info!(%url, "No active session, logging in");
        self.login().await
    }

    async fn context(&self, token: BearerToken) -> AuthContext {
        let cookies = match self.browser.cookies().await {
            Ok(cookies) => cookies,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read browser cookies");
                Vec::new()
            }
        };
        AuthContext::new(token).with_cookies(cookies)
    }

    async fn resolve_after_login(&self) -> Result<AuthContext, SessionError> {
        self.login().await?;
        match self.resolver.resolve(self.browser.as_ref()).await {
            Some(token) => Ok(self.context(token).await),
            None => Err(SessionError::Authentication(
                "could not obtain a bearer token after login".to_string(),
            )),
        }
    }

    /// Logged-in session plus a bearer token.
    pub async fn resolve_session(&self) -> Result<AuthContext, SessionError> {
        self.ensure_session().await?;
        match self.resolver.resolve(self.browser.as_ref()).await {
            Some(token) => Ok(self.context(token).await),
            None => {
                tracing::info!("No bearer token found, logging in again");
                self.resolve_after_login().await
            }
        }
    }

    /// New credentials after the server rejected `rejected`.
    async fn recover(&self, rejected: &BearerToken) -> Result<AuthContext, SessionError> {
        self.resolver.invalidate();
        match self.resolver.resolve(self.browser.as_ref()).await {
            Some(token) if !token.same_value(rejected) => return Ok(self.context(token).await),
            Some(_) => {
                tracing::info!("Storage still holds the rejected token, forcing login");
                self.resolver.invalidate();
            }
            None => tracing::info!("No token after invalidation, forcing login"),
        }
        self.authenticated.store(false, Ordering::SeqCst);
        self.resolve_after_login().await
    }

    /// Run `op` with a valid session, retrying once after an authorization
    /// failure. A second authorization failure is returned to the caller.
    pub async fn with_session<T, F, Fut>(&self, mut op: F) -> Result<T, SessionError>
    where
        F: FnMut(AuthContext) -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let ctx = self.resolve_session().await?;
        let rejected = ctx.token.clone();

        match op(ctx).await {
            Err(e) if e.is_authorization_expired() => {
                tracing::warn!(
                    error = %e,
                    prefix = rejected.prefix(),
                    "Bearer token rejected, re-authenticating and retrying once"
                );
                let ctx = self.recover(&rejected).await?;
                op(ctx).await
            }
            other => other,
        }
    }

    /// Collect every item of a paginated endpoint.
    pub async fn fetch_all(
        &self,
        endpoint: Arc<dyn PagedEndpoint>,
    ) -> Result<Collected<Value>, SessionError> {
        let config = self
            .config
            .collector
            .collector(Some(endpoint.page_size()));
        let client = &self.client;

        let collected = self
            .with_session(|ctx| {
                let endpoint = endpoint.clone();
                let config = config.clone();
                async move {
                    let key_endpoint = endpoint.clone();
                    let derive_endpoint = endpoint.clone();
                    let collector = Collector::new(config, move |item: &Value| {
                        key_endpoint.item_key(item)
                    })
                    .with_derived_cursor(move |item: &Value| derive_endpoint.derive_cursor(item));

                    collector
                        .paginate(|cursor| {
                            let endpoint = endpoint.clone();
                            let ctx = ctx.clone();
                            async move { endpoint.fetch_page(client, &ctx, cursor.as_ref()).await }
                        })
                        .await
                }
            })
            .await?;

        tracing::info!(
            endpoint = endpoint.name(),
            items = collected.items.len(),
            pages = collected.pages,
            status = %collected.status,
            "Fetched endpoint"
        );
        Ok(collected)
    }

    /// Products (accounts, cards, depots) as returned by the portal.
    pub async fn accounts(&self) -> Result<Vec<Value>, SessionError> {
        let client = &self.client;
        self.with_session(|ctx| async move { client.products(&ctx).await })
            .await
    }

    pub async fn portfolio(
        &self,
        depot_id: &str,
        as_of: Option<NaiveDate>,
    ) -> Result<Value, SessionError> {
        let client = &self.client;
        self.with_session(|ctx| async move { client.positions(&ctx, depot_id, as_of).await })
            .await
    }

    /// Collect a UI list through a [`Revealer`] in the logged-in browser.
    pub async fn collect_revealed<T, R>(
        &self,
        revealer: &mut R,
        key: impl Fn(&T) -> String + Send + Sync + 'static,
    ) -> Result<Collected<T>, SessionError>
    where
        R: Revealer<T> + ?Sized,
    {
        self.ensure_session().await?;
        let collector = Collector::new(self.config.collector.collector(None), key);
        collector.reveal(revealer).await
    }

    /// The document mailbox, read from the page instead of the API.
    ///
    /// With a download directory set, every listed document is saved there.
    pub async fn documents_via_ui(
        &self,
        query: &DocumentQuery,
    ) -> Result<Collected<DocumentRow>, SessionError> {
        self.ensure_session().await?;
        let timeouts = &self.config.timeouts;
        let mut revealer = DocumentRevealer::new(self.browser.clone(), timeouts.reveal_settle);
        if let Some(dir) = &query.download_dir {
            revealer = revealer.download_into(dir, timeouts.download).await?;
        }
        revealer
            .open(&self.config.portal.documents_url, query, timeouts.login_element)
            .await?;
        let collected = self.collect_revealed(&mut revealer, DocumentRow::key).await?;

        if query.download_dir.is_some() {
            let saved = collected.items.iter().filter(|row| row.file.is_some()).count();
            tracing::info!(saved, listed = collected.items.len(), "Document downloads finished");
        }
        Ok(collected)
    }

    /// Close the browser, then forget the token, the last-URL marker and
    /// the browser profile.
    pub async fn logout(&self) -> anyhow::Result<()> {
        self.authenticated.store(false, Ordering::SeqCst);
        if let Err(e) = self.browser.close().await {
            tracing::warn!(error = %e, "Failed to close browser before logout");
        }
        forget_session(self.resolver.cache(), &self.config.profile_dir)?;
        Ok(())
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.browser.close().await
    }
}

/// Remove everything that lets a later run skip login.
///
/// Returns whether a browser profile was deleted. The browser using the
/// profile must already be closed.
pub fn forget_session(cache: &TokenCache, profile_dir: &Path) -> anyhow::Result<bool> {
    use anyhow::Context;

    cache.clear_cached_token()?;
    cache.clear_last_url()?;
    let removed = profile_dir.exists();
    if removed {
        std::fs::remove_dir_all(profile_dir).with_context(|| {
            format!("Failed to delete browser profile: {}", profile_dir.display())
        })?;
    }
    tracing::info!(profile_removed = removed, "Cleared cached session state");
    Ok(removed)
}
