//! Session authentication: the login state machine and bearer token lookup.

pub mod login;
pub mod region;
pub mod token;

pub use login::{
    ApprovalNotifier, Authenticator, LoginFailure, LoginReport, LoginState, StdoutNotifier,
};
pub use region::{region_for, region_prefix, REGIONS};
pub use token::{
    CachedToken, LiveStorage, NetworkCapture, PersistedStorage, TokenResolver, TokenStrategy,
};
