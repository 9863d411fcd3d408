//! Error taxonomy for session and collection failures.
//!
//! Each variant carries a different recovery policy:
//!
//! | Variant                 | Who retries                              |
//! |-------------------------|------------------------------------------|
//! | `TransientService`      | nobody; the caller backs off             |
//! | `Authentication`        | nobody; needs new input or approval      |
//! | `AuthorizationExpired`  | the orchestrator, exactly once           |
//! | `Configuration`         | nobody; the operator fixes the setup     |
//! | `Transport`             | nobody; unclassified, fatal at top level |
//!
//! A stalled pagination cursor is not an error: it ends collection with
//! [`crate::collect::CollectStatus::Stalled`] and keeps the partial data.

use std::time::Duration;

/// Typed failure of a session-bound operation.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The portal reported itself unavailable (HTTP 503 page or similar).
    #[error("service temporarily unavailable: {0}")]
    TransientService(String),

    /// Login did not complete: bad credentials, rejected or missing approval.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The bearer token was rejected while performing an operation.
    #[error("authorization expired (HTTP {status})")]
    AuthorizationExpired { status: u16 },

    /// Setup problem that needs an operator fix (unknown region, missing credentials).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Anything else; propagated to the top level unchanged.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl SessionError {
    pub fn is_authorization_expired(&self) -> bool {
        matches!(self, SessionError::AuthorizationExpired { .. })
    }

    /// True for failures where trying again later can succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionError::TransientService(_))
    }

    pub(crate) fn approval_timeout(waited: Duration) -> Self {
        SessionError::Authentication(format!(
            "timed out after {}s waiting for login approval",
            waited.as_secs()
        ))
    }
}
