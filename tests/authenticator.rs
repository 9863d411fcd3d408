mod support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use elbakit::auth::{Authenticator, LoginFailure, LoginState};
use elbakit::config::{PortalConfig, TimeoutConfig};
use elbakit::credentials::{Credential, TokenCache};
use elbakit::SessionError;
use support::{
    FakeBrowser, RecordingNotifier, Transition, DASHBOARD_URL, ERROR_BOX, IDENTIFIER, PIN,
};
use tempfile::TempDir;

fn authenticator(notifier: Arc<RecordingNotifier>) -> Authenticator {
    Authenticator::new(PortalConfig::default(), support::fast_timeouts()).with_notifier(notifier)
}

fn credential() -> Credential {
    Credential::new(IDENTIFIER, PIN)
}

#[tokio::test]
async fn approved_login_walks_every_state() -> Result<()> {
    let dir = TempDir::new()?;
    let cache = Arc::new(TokenCache::with_path(dir.path())?);
    let notifier = Arc::new(RecordingNotifier::default());
    let browser = FakeBrowser::login_form().on_submit(Transition::approved("4711"));

    let report = authenticator(notifier.clone())
        .with_cache(cache.clone())
        .run(&browser, &credential())
        .await;

    assert!(report.is_success(), "outcome: {:?}", report.outcome());
    assert_eq!(
        report.trail,
        vec![
            LoginState::Start,
            LoginState::RegionSelect,
            LoginState::CredentialsEntered,
            LoginState::AwaitingApproval,
            LoginState::Success,
        ]
    );
    assert_eq!(report.approval_code.as_deref(), Some("4711"));
    assert_eq!(notifier.codes(), vec!["4711".to_string()]);
    assert!(browser
        .clicks()
        .iter()
        .any(|c| c.ends_with(":Raiffeisen Lower Austria")));
    let filled: Vec<String> = browser.fills().into_iter().map(|(_, v)| v).collect();
    assert_eq!(filled, vec![IDENTIFIER.to_string(), PIN.to_string()]);
    assert_eq!(cache.read_last_url().as_deref(), Some(DASHBOARD_URL));
    Ok(())
}

#[tokio::test]
async fn existing_session_skips_the_form() -> Result<()> {
    let browser = FakeBrowser::logged_in();

    let report = authenticator(Arc::default()).run(&browser, &credential()).await;

    assert_eq!(report.trail, vec![LoginState::Start, LoginState::Success]);
    assert!(browser.fills().is_empty());
    Ok(())
}

#[tokio::test]
async fn service_unavailable_is_transient() -> Result<()> {
    let browser = FakeBrowser::login_form().with_title("503 Service Unavailable");

    let report = authenticator(Arc::default()).run(&browser, &credential()).await;

    let failure = report.failure().cloned().expect("failed");
    assert_eq!(failure, LoginFailure::ServiceUnavailable);
    assert!(browser.fills().is_empty());
    assert!(SessionError::from(failure).is_transient());
    Ok(())
}

#[tokio::test]
async fn unknown_region_is_a_configuration_error() -> Result<()> {
    let browser = FakeBrowser::login_form();

    let report = authenticator(Arc::default())
        .run(&browser, &Credential::new("XXXXXXXX0001", PIN))
        .await;

    let failure = report.failure().cloned().expect("failed");
    assert_eq!(failure, LoginFailure::UnknownRegion("XXXXXXXX".to_string()));
    assert!(matches!(
        SessionError::from(failure),
        SessionError::Configuration(msg) if msg.contains("XXXXXXXX")
    ));
    assert!(browser.fills().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn region_missing_from_dropdown() -> Result<()> {
    let browser = FakeBrowser::login_form().with_texts("rds-option", &["Raiffeisen Tyrol"]);

    let report = authenticator(Arc::default()).run(&browser, &credential()).await;

    assert_eq!(
        report.failure(),
        Some(&LoginFailure::RegionNotOffered("Lower Austria".to_string()))
    );
    Ok(())
}

#[tokio::test]
async fn invalid_signature_data() -> Result<()> {
    let browser = FakeBrowser::login_form()
        .on_submit(Transition::content("<p>Invalid signature data</p>"));

    let report = authenticator(Arc::default()).run(&browser, &credential()).await;

    assert_eq!(report.failure(), Some(&LoginFailure::InvalidCredentials));
    assert!(report.approval_code.is_none());
    Ok(())
}

#[tokio::test]
async fn error_box_text_is_reported() -> Result<()> {
    let mut transition = Transition::content("<p>Fehler</p>");
    transition.show.push(ERROR_BOX.to_string());
    transition
        .texts
        .push((ERROR_BOX.to_string(), vec!["Zugang gesperrt".to_string()]));
    let browser = FakeBrowser::login_form().on_submit(transition);

    let report = authenticator(Arc::default()).run(&browser, &credential()).await;

    assert_eq!(
        report.failure(),
        Some(&LoginFailure::Rejected("Zugang gesperrt".to_string()))
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unapproved_login_times_out() -> Result<()> {
    let timeouts = TimeoutConfig {
        approval_timeout: Duration::from_secs(300),
        approval_poll: Duration::from_secs(1),
        ..support::fast_timeouts()
    };
    let notifier = Arc::new(RecordingNotifier::default());
    let browser = FakeBrowser::login_form().on_submit(Transition::pending("1234"));

    let started = tokio::time::Instant::now();
    let report = Authenticator::new(PortalConfig::default(), timeouts)
        .with_notifier(notifier.clone())
        .run(&browser, &credential())
        .await;
    let waited = started.elapsed();

    let failure = report.failure().cloned().expect("failed");
    assert_eq!(failure, LoginFailure::ApprovalTimeout(Duration::from_secs(300)));
    assert!(waited >= Duration::from_secs(300), "waited {waited:?}");
    assert!(waited < Duration::from_secs(310), "waited {waited:?}");
    assert_eq!(notifier.codes(), vec!["1234".to_string()]);
    assert!(matches!(
        SessionError::from(failure),
        SessionError::Authentication(msg) if msg.contains("300s")
    ));
    Ok(())
}

#[tokio::test]
async fn bounce_back_to_login_after_approval() -> Result<()> {
    let mut transition = Transition::approved("4711");
    transition.clear_redirects = false;
    let browser = FakeBrowser::login_form().on_submit(transition);

    let report = authenticator(Arc::default()).run(&browser, &credential()).await;

    assert_eq!(report.failure(), Some(&LoginFailure::RedirectedToLogin));
    assert!(!report.trail.contains(&LoginState::Success));
    Ok(())
}

#[tokio::test]
async fn expired_page_is_restarted_then_login_continues() -> Result<()> {
    let browser = FakeBrowser::login_form()
        .with_content("<h1>Session expired</h1><button>Restart</button>")
        .with_texts("button", &["Restart"])
        .on_click("Restart", Transition::content("<html>login</html>"))
        .on_submit(Transition::approved("4711"));

    let report = authenticator(Arc::default()).run(&browser, &credential()).await;

    assert!(report.is_success(), "outcome: {:?}", report.outcome());
    assert_eq!(browser.clicks()[0], "button:Restart");
    assert_eq!(browser.fills().len(), 2);
    assert!(report.trail.contains(&LoginState::AwaitingApproval));
    Ok(())
}

#[tokio::test]
async fn session_expiring_while_awaiting_approval() -> Result<()> {
    let mut transition = Transition::pending("1234");
    transition.content = Some("<p>Session expired</p>".to_string());
    let browser = FakeBrowser::login_form().on_submit(transition);

    let report = authenticator(Arc::default()).run(&browser, &credential()).await;

    assert_eq!(report.failure(), Some(&LoginFailure::SessionExpired));
    assert_eq!(report.approval_code.as_deref(), Some("1234"));
    assert_eq!(
        report.trail.last(),
        Some(&LoginState::Failed(LoginFailure::SessionExpired))
    );
    Ok(())
}

#[tokio::test]
async fn outage_during_approval_wins_over_dashboard() -> Result<()> {
    let mut transition = Transition::approved("4711");
    transition.content = Some("<h1>Service Unavailable</h1>".to_string());
    let browser = FakeBrowser::login_form().on_submit(transition);

    let report = authenticator(Arc::default()).run(&browser, &credential()).await;

    assert_eq!(report.failure(), Some(&LoginFailure::ServiceUnavailable));
    assert!(!report.trail.contains(&LoginState::Success));
    Ok(())
}

#[tokio::test]
async fn failed_dashboard_navigation_only_warns() -> Result<()> {
    let dir = TempDir::new()?;
    let cache = Arc::new(TokenCache::with_path(dir.path())?);
    let browser = FakeBrowser::logged_in().failing_navigation_to(DASHBOARD_URL);

    let report = authenticator(Arc::default())
        .with_cache(cache.clone())
        .run(&browser, &credential())
        .await;

    assert_eq!(report.trail, vec![LoginState::Start, LoginState::Success]);
    assert!(browser.gotos().contains(&DASHBOARD_URL.to_string()));
    assert_eq!(cache.read_last_url().as_deref(), Some(DASHBOARD_URL));
    Ok(())
}

#[tokio::test]
async fn unwritable_last_url_only_warns() -> Result<()> {
    let dir = TempDir::new()?;
    let session_dir = dir.path().join("session");
    let cache = Arc::new(TokenCache::with_path(&session_dir)?);
    std::fs::remove_dir_all(&session_dir)?;
    let browser = FakeBrowser::login_form().on_submit(Transition::approved("4711"));

    let report = authenticator(Arc::default())
        .with_cache(cache.clone())
        .run(&browser, &credential())
        .await;

    assert!(report.is_success(), "outcome: {:?}", report.outcome());
    assert!(cache.read_last_url().is_none());
    Ok(())
}
