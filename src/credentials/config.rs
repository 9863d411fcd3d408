//! Credential backend configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{CredentialStore, EnvFileStore, EnvVarStore};

fn default_id_var() -> String {
    "ELBA_ID".to_string()
}

fn default_pin_var() -> String {
    "ELBA_PIN".to_string()
}

/// Which backend holds the user identifier and PIN.
///
/// # Example
///
/// ```toml
/// [credentials]
/// backend = "env"
/// id_var = "ELBA_ID"
/// pin_var = "ELBA_PIN"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum CredentialConfig {
    /// Dotenv-style file with `ELBA_ID=` / `ELBA_PIN=` lines.
    File { path: PathBuf },

    /// Process environment (read-only).
    Env {
        #[serde(default = "default_id_var")]
        id_var: String,
        #[serde(default = "default_pin_var")]
        pin_var: String,
    },
}

impl CredentialConfig {
    /// Build a credential store from this configuration.
    pub fn build(&self) -> Box<dyn CredentialStore> {
        match self {
            CredentialConfig::File { path } => Box::new(EnvFileStore::new(path.clone())),
            CredentialConfig::Env { id_var, pin_var } => {
                Box::new(EnvVarStore::new(id_var.clone(), pin_var.clone()))
            }
        }
    }

    /// Human-readable location, for "credentials not found" messages.
    pub fn describe(&self) -> String {
        match self {
            CredentialConfig::File { path } => path.display().to_string(),
            CredentialConfig::Env { id_var, pin_var } => format!("${id_var} / ${pin_var}"),
        }
    }
}
