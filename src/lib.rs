pub mod api;
pub mod auth;
pub mod browser;
pub mod clock;
pub mod collect;
pub mod config;
pub mod credentials;
pub mod debug;
pub mod duration;
pub mod error;
pub mod orchestrator;
pub mod scrape;

pub use api::AuthContext;
pub use error::SessionError;
pub use orchestrator::SessionOrchestrator;
