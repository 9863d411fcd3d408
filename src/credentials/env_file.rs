//! Dotenv-file and environment-variable credential backends.
//!
//! The file format is the one the `setup` command writes:
//!
//! ```text
//! ELBA_ID='ELVIE32V12345'
//! ELBA_PIN='12345'
//! ```
//!
//! Files written by hand are read with `dotenvy`, so `export` prefixes,
//! quoting and trailing comments follow the usual dotenv rules.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{restrict_permissions, CredentialStore, IDENTIFIER_KEY, SECRET_KEY};

/// Map a logical key to the variable name used in files and the environment.
fn variable_name(key: &str) -> String {
    match key {
        IDENTIFIER_KEY => "ELBA_ID".to_string(),
        SECRET_KEY => "ELBA_PIN".to_string(),
        other => other.to_uppercase(),
    }
}

/// Credential store backed by a dotenv-style file.
pub struct EnvFileStore {
    path: PathBuf,
}

impl EnvFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn read_entries(&self) -> Result<Option<EnvEntries>> {
        if !self.path.exists() {
            return Ok(None);
        }
        EnvEntries::read(&self.path).map(Some)
    }
}

#[async_trait]
impl CredentialStore for EnvFileStore {
    async fn get(&self, key: &str) -> Result<Option<SecretString>> {
        let Some(entries) = self.read_entries()? else {
            return Ok(None);
        };
        Ok(entries
            .get(&variable_name(key))
            .map(|v| SecretString::from(v.to_string())))
    }

    async fn set(&self, key: &str, value: SecretString) -> Result<()> {
        let mut entries = self.read_entries()?.unwrap_or_default();
        entries.set(&variable_name(key), value.expose_secret());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create credentials dir: {}", parent.display())
            })?;
        }
        std::fs::write(&self.path, entries.to_string()).with_context(|| {
            format!("Failed to write credentials file: {}", self.path.display())
        })?;
        restrict_permissions(&self.path)?;
        Ok(())
    }
}

/// Read-only store over process environment variables.
pub struct EnvVarStore {
    id_var: String,
    pin_var: String,
}

impl EnvVarStore {
    pub fn new(id_var: impl Into<String>, pin_var: impl Into<String>) -> Self {
        Self {
            id_var: id_var.into(),
            pin_var: pin_var.into(),
        }
    }
}

#[async_trait]
impl CredentialStore for EnvVarStore {
    async fn get(&self, key: &str) -> Result<Option<SecretString>> {
        let var = match key {
            IDENTIFIER_KEY => self.id_var.clone(),
            SECRET_KEY => self.pin_var.clone(),
            other => variable_name(other),
        };
        Ok(std::env::var(var).ok().map(SecretString::from))
    }

    async fn set(&self, _key: &str, _value: SecretString) -> Result<()> {
        anyhow::bail!("Environment credential backend is read-only")
    }

    fn supports_write(&self) -> bool {
        false
    }
}

/// Entries of a dotenv file, in file order so rewrites keep the layout.
#[derive(Debug, Default)]
struct EnvEntries {
    lines: Vec<(String, String)>,
}

impl EnvEntries {
    fn read(path: &std::path::Path) -> Result<Self> {
        let context = || format!("Failed to read credentials file: {}", path.display());
        let mut entries = Self::default();
        for item in dotenvy::from_path_iter(path).with_context(context)? {
            let (key, value) = item.with_context(context)?;
            entries.set(&key, &value);
        }
        Ok(entries)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn set(&mut self, key: &str, value: &str) {
        match self.lines.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.lines.push((key.to_string(), value.to_string())),
        }
    }
}

/// Quote a value so dotenv readers get it back verbatim.
///
/// Single quotes take everything literally. Values that contain one fall
/// back to double quotes, where `\`, `"` and `$` must be escaped.
fn quote(value: &str) -> String {
    if !value.contains('\'') {
        return format!("'{value}'");
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

impl std::fmt::Display for EnvEntries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (key, value) in &self.lines {
            writeln!(f, "{key}={}", quote(value))?;
        }
        Ok(())
    }
}
