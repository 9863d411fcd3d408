//! Raw payload dumps for troubleshooting portal responses.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::clock::{Clock, SystemClock};

/// Writes JSON payloads as `<stamp>-<prefix>.json` into a directory.
pub struct DebugDumper {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl DebugDumper {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, prefix: &str, payload: &serde_json::Value) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create debug dir: {}", self.dir.display()))?;
        let path = self
            .dir
            .join(format!("{}-{}.json", self.clock.file_stamp(), sanitize(prefix)));
        let content =
            serde_json::to_string_pretty(payload).context("Failed to serialize debug payload")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write debug file: {}", path.display()))?;
        Ok(path)
    }

    /// Dump `payload`. Failures are logged, never returned.
    pub fn dump(&self, prefix: &str, payload: &serde_json::Value) -> Option<PathBuf> {
        match self.write(prefix, payload) {
            Ok(path) => {
                tracing::debug!(path = %path.display(), "Wrote debug payload");
                Some(path)
            }
            Err(e) => {
                tracing::warn!(error = %e, prefix, "Failed to write debug payload");
                None
            }
        }
    }
}

fn sanitize(prefix: &str) -> String {
    prefix
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}
