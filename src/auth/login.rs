//! Interactive login state machine.
//!
//! ```text
//! Start ──► RegionSelect ──► CredentialsEntered ──► AwaitingApproval ──► Success
//!   │            │                   │                     │               │
//!   └────────────┴───────────────────┴─────────────────────┴───────────────┴──► Failed(_)
//! ```
//!
//! `Start` can also jump straight to `Success` when the persistent browser
//! profile is still logged in. There is no automatic retry; the caller
//! decides what a failure means.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::region::{option_matches, region_for, region_prefix};
use crate::browser::BrowserSession;
use crate::config::{PortalConfig, TimeoutConfig};
use crate::credentials::{Credential, TokenCache};
use crate::error::SessionError;

mod selectors {
    pub const REGION_DROPDOWN: &str = r#"rds-select[formcontrolname="mandant"]"#;
    pub const REGION_OPTION: &str = "rds-option";
    pub const IDENTIFIER_INPUT: &str = r#"input[formcontrolname="verfuegerNr"]"#;
    pub const PIN_INPUT: &str = r#"input[formcontrolname="pin"]"#;
    pub const SUBMIT_ENABLED: &str = r#"button[type="submit"]:not([disabled])"#;
    pub const APPROVAL_CODE: &str = "p.rds-display-1";
    pub const ERROR_BOX: &str = "div#error_message";
    pub const PRODUCT_CARD: &str = "banking-product-card";
    pub const BUTTON: &str = "button";
}

const MAX_REGION_ATTEMPTS: usize = 20;

/// Where the login flow is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    Start,
    RegionSelect,
    CredentialsEntered,
    AwaitingApproval,
    Success,
    Failed(LoginFailure),
}

/// Why a login attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginFailure {
    /// The portal answered with a 503 / maintenance page. Retry later.
    ServiceUnavailable,
    /// Identifier prefix not in the region table.
    UnknownRegion(String),
    /// The region is known but the dropdown does not offer it.
    RegionNotOffered(String),
    /// The login form could not be filled or submitted.
    Form(String),
    SessionExpired,
    InvalidCredentials,
    /// The portal showed an error message.
    Rejected(String),
    ApprovalTimeout(Duration),
    /// Landed back on the login host right after a successful login.
    RedirectedToLogin,
    /// The browser itself failed (navigation error, crashed page).
    Browser(String),
}

impl std::fmt::Display for LoginFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoginFailure::ServiceUnavailable => write!(f, "ELBA service unavailable"),
            LoginFailure::UnknownRegion(prefix) => {
                write!(f, "unknown region for identifier prefix {prefix}")
            }
            LoginFailure::RegionNotOffered(region) => {
                write!(f, "region '{region}' not offered by the login form")
            }
            LoginFailure::Form(msg) => write!(f, "login form error: {msg}"),
            LoginFailure::SessionExpired => write!(f, "session expired during login"),
            LoginFailure::InvalidCredentials => write!(f, "invalid signature data"),
            LoginFailure::Rejected(msg) => write!(f, "login rejected: {msg}"),
            LoginFailure::ApprovalTimeout(waited) => {
                write!(f, "no approval within {}s", waited.as_secs())
            }
            LoginFailure::RedirectedToLogin => {
                write!(f, "redirected back to login after success")
            }
            LoginFailure::Browser(msg) => write!(f, "browser error: {msg}"),
        }
    }
}

impl From<LoginFailure> for SessionError {
    fn from(failure: LoginFailure) -> Self {
        match failure {
            LoginFailure::ServiceUnavailable => {
                SessionError::TransientService(failure.to_string())
            }
            LoginFailure::UnknownRegion(_) => SessionError::Configuration(failure.to_string()),
            LoginFailure::ApprovalTimeout(waited) => SessionError::approval_timeout(waited),
            LoginFailure::Browser(msg) => SessionError::Transport(anyhow::anyhow!(msg)),
            other => SessionError::Authentication(other.to_string()),
        }
    }
}

/// The states visited by one login run, ending in `Success` or `Failed`.
#[derive(Debug, Clone)]
pub struct LoginReport {
    pub trail: Vec<LoginState>,
    pub approval_code: Option<String>,
}

impl LoginReport {
    fn new() -> Self {
        Self {
            trail: vec![LoginState::Start],
            approval_code: None,
        }
    }

    fn enter(&mut self, state: LoginState) {
        tracing::debug!(state = ?state, "Login state");
        self.trail.push(state);
    }

    fn fail(mut self, failure: LoginFailure) -> Self {
        tracing::warn!(reason = %failure, "Login failed");
        self.enter(LoginState::Failed(failure));
        self
    }

    fn succeed(mut self) -> Self {
        self.enter(LoginState::Success);
        self
    }

    pub fn outcome(&self) -> &LoginState {
        self.trail.last().unwrap_or(&LoginState::Start)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome(), LoginState::Success)
    }

    pub fn failure(&self) -> Option<&LoginFailure> {
        match self.outcome() {
            LoginState::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Surfaces the one-time approval code to the user.
pub trait ApprovalNotifier: Send + Sync {
    fn notify(&self, code: &str);
}

/// Prints the approval code as a banner on stdout.
#[derive(Debug, Default)]
pub struct StdoutNotifier;

impl ApprovalNotifier for StdoutNotifier {
    fn notify(&self, code: &str) {
        println!();
        println!("========================================");
        println!("ELBA APPROVAL CODE: {code}");
        println!("Confirm the login in your banking app.");
        println!("========================================");
        println!();
    }
}

/// Runs the login state machine against a browser.
pub struct Authenticator {
    portal: PortalConfig,
    timeouts: TimeoutConfig,
    notifier: Arc<dyn ApprovalNotifier>,
    cache: Option<Arc<TokenCache>>,
}

impl Authenticator {
    pub fn new(portal: PortalConfig, timeouts: TimeoutConfig) -> Self {
        Self {
            portal,
            timeouts,
            notifier: Arc::new(StdoutNotifier),
            cache: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ApprovalNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Record the last authenticated URL in this cache after success.
    pub fn with_cache(mut self, cache: Arc<TokenCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub async fn run(&self, browser: &dyn BrowserSession, credential: &Credential) -> LoginReport {
        let mut report = LoginReport::new();
        tracing::info!(id = credential.display_prefix(), "Starting login");

        if let Err(e) = browser.goto(&self.portal.login_url).await {
            return report.fail(LoginFailure::Browser(format!("{e:#}")));
        }
        tokio::time::sleep(self.timeouts.page_settle).await;

        if service_unavailable(browser).await {
            return report.fail(LoginFailure::ServiceUnavailable);
        }
        if session_expired(browser).await {
            tracing::info!("Session expired page, restarting");
            match browser.click_text(selectors::BUTTON, "Restart").await {
                Ok(true) => tokio::time::sleep(self.timeouts.page_settle).await,
                Ok(false) => {}
                Err(e) => tracing::debug!(error = %e, "Restart click failed"),
            }
        } else if self.on_authenticated_page(browser).await {
            tracing::info!("Already logged in");
            return self.confirm(browser, report.succeed()).await;
        }

        report.enter(LoginState::RegionSelect);
        if let Err(failure) = self.select_region(browser, &credential.identifier).await {
            return report.fail(failure);
        }

        report.enter(LoginState::CredentialsEntered);
        if let Err(failure) = self.enter_credentials(browser, credential).await {
            return report.fail(failure);
        }

        report.enter(LoginState::AwaitingApproval);
        report.approval_code = self.read_approval_code(browser).await;
        match self.await_approval(browser).await {
            Ok(()) => self.confirm(browser, report.succeed()).await,
            Err(failure) => report.fail(failure),
        }
    }

    async fn on_authenticated_page(&self, browser: &dyn BrowserSession) -> bool {
        match browser.current_url().await {
            Ok(url) => self.portal.is_authenticated_url(&url),
            Err(_) => false,
        }
    }

    async fn select_region(
        &self,
        browser: &dyn BrowserSession,
        identifier: &str,
    ) -> Result<(), LoginFailure> {
        let region = region_for(identifier)
            .ok_or_else(|| LoginFailure::UnknownRegion(region_prefix(identifier)))?;
        tracing::info!(prefix = %region_prefix(identifier), region, "Selecting region");

        let present = browser
            .wait_for(selectors::REGION_DROPDOWN, self.timeouts.login_element)
            .await
            .map_err(|e| LoginFailure::Browser(format!("{e:#}")))?;
        if !present {
            return Err(LoginFailure::Form("region dropdown not found".to_string()));
        }
        browser
            .click(selectors::REGION_DROPDOWN)
            .await
            .map_err(|e| LoginFailure::Form(format!("could not open region dropdown: {e:#}")))?;
        tokio::time::sleep(Duration::from_millis(500)).await;

        for attempt in 0..MAX_REGION_ATTEMPTS {
            let options = browser
                .texts(selectors::REGION_OPTION)
                .await
                .unwrap_or_default();
            if let Some(option) = options.iter().find(|o| option_matches(o, region)) {
                if browser
                    .click_text(selectors::REGION_OPTION, option)
                    .await
                    .unwrap_or(false)
                {
                    tracing::debug!(option = %option, attempt, "Region selected");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    return Ok(());
                }
            }
            if let Err(e) = browser.press(selectors::REGION_DROPDOWN, "ArrowDown").await {
                tracing::debug!(error = %e, "ArrowDown failed");
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Err(LoginFailure::RegionNotOffered(region.to_string()))
    }

    async fn enter_credentials(
        &self,
        browser: &dyn BrowserSession,
        credential: &Credential,
    ) -> Result<(), LoginFailure> {
        use secrecy::ExposeSecret;

        let form = |e: anyhow::Error| LoginFailure::Form(format!("{e:#}"));
        browser
            .fill(selectors::IDENTIFIER_INPUT, &credential.identifier)
            .await
            .map_err(form)?;
        browser
            .fill(selectors::PIN_INPUT, credential.secret.expose_secret())
            .await
            .map_err(form)?;

        let enabled = browser
            .wait_for(selectors::SUBMIT_ENABLED, self.timeouts.login_element)
            .await
            .map_err(form)?;
        if !enabled {
            return Err(LoginFailure::Form(
                "submit button never became enabled".to_string(),
            ));
        }
        tokio::time::sleep(self.timeouts.page_settle).await;
        browser.click(selectors::SUBMIT_ENABLED).await.map_err(form)?;
        Ok(())
    }

    async fn read_approval_code(&self, browser: &dyn BrowserSession) -> Option<String> {
        let shown = browser
            .wait_for(selectors::APPROVAL_CODE, self.timeouts.login_element)
            .await
            .unwrap_or(false);
        if !shown {
            tracing::info!("No approval code shown, checking for errors");
            return None;
        }
        let code = browser
            .text(selectors::APPROVAL_CODE)
            .await
            .ok()
            .flatten()
            .filter(|c| !c.is_empty())?;
        self.notifier.notify(&code);
        Some(code)
    }

    async fn await_approval(&self, browser: &dyn BrowserSession) -> Result<(), LoginFailure> {
        let ceiling = self.timeouts.approval_timeout;
        let deadline = tokio::time::Instant::now() + ceiling;
        tracing::info!(timeout = ?ceiling, "Waiting for login approval");

        loop {
            if service_unavailable(browser).await {
                return Err(LoginFailure::ServiceUnavailable);
            }
            if self.on_authenticated_page(browser).await {
                tracing::info!("Login approved");
                return Ok(());
            }
            if let Some(failure) = page_error(browser).await {
                return Err(failure);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LoginFailure::ApprovalTimeout(ceiling));
            }
            tokio::time::sleep(self.timeouts.approval_poll).await;
        }
    }

    /// Load the dashboard once so the session is fully established.
    async fn confirm(&self, browser: &dyn BrowserSession, report: LoginReport) -> LoginReport {
        if let Err(e) = browser.goto(&self.portal.dashboard_url).await {
            tracing::warn!(error = %e, "Dashboard navigation after login failed");
        }
        tokio::time::sleep(self.timeouts.page_settle).await;

        let url = browser.current_url().await.unwrap_or_default();
        if self.portal.is_login_url(&url) {
            let mut report = report;
            report.trail.pop();
            return report.fail(LoginFailure::RedirectedToLogin);
        }

        match browser
            .wait_for(selectors::PRODUCT_CARD, self.timeouts.login_element)
            .await
        {
            Ok(true) => tracing::info!("Dashboard loaded"),
            Ok(false) => tracing::warn!("Dashboard loaded but no product cards visible yet"),
            Err(e) => tracing::warn!(error = %e, "Could not check dashboard"),
        }

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.write_last_url(&url) {
                tracing::warn!(error = %e, "Failed to save last URL");
            }
        }
        report
    }
}

async fn service_unavailable(browser: &dyn BrowserSession) -> bool {
    let content = browser.content().await.unwrap_or_default();
    if content.contains("Service Unavailable") {
        return true;
    }
    browser
        .title()
        .await
        .map(|t| t.contains("503"))
        .unwrap_or(false)
}

async fn session_expired(browser: &dyn BrowserSession) -> bool {
    let content = browser.content().await.unwrap_or_default();
    content.contains("Session expired") || content.contains("Page Expired")
}

async fn page_error(browser: &dyn BrowserSession) -> Option<LoginFailure> {
    let content = browser.content().await.unwrap_or_default();
    if content.contains("Session expired") || content.contains("Page Expired") {
        return Some(LoginFailure::SessionExpired);
    }
    if content.contains("Invalid signature data") {
        return Some(LoginFailure::InvalidCredentials);
    }
    if browser.is_visible(selectors::ERROR_BOX).await.unwrap_or(false) {
        let message = browser
            .text(selectors::ERROR_BOX)
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        return Some(LoginFailure::Rejected(message));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_map_to_error_kinds() {
        assert!(SessionError::from(LoginFailure::ServiceUnavailable).is_transient());
        assert!(matches!(
            SessionError::from(LoginFailure::UnknownRegion("XXXXXXXX".into())),
            SessionError::Configuration(_)
        ));
        assert!(matches!(
            SessionError::from(LoginFailure::InvalidCredentials),
            SessionError::Authentication(_)
        ));
        assert!(matches!(
            SessionError::from(LoginFailure::ApprovalTimeout(Duration::from_secs(300))),
            SessionError::Authentication(msg) if msg.contains("300s")
        ));
        assert!(matches!(
            SessionError::from(LoginFailure::Browser("crashed".into())),
            SessionError::Transport(_)
        ));
    }

    #[test]
    fn report_outcome() {
        let report = LoginReport::new().succeed();
        assert!(report.is_success());
        assert!(report.failure().is_none());

        let report = LoginReport::new().fail(LoginFailure::SessionExpired);
        assert_eq!(report.failure(), Some(&LoginFailure::SessionExpired));
        assert_eq!(
            report.trail,
            vec![
                LoginState::Start,
                LoginState::Failed(LoginFailure::SessionExpired)
            ]
        );
    }
}
