//! Document mailbox scraping through the virtual-scroll list.
//!
//! The mailbox renders only the rows in view. [`DocumentRevealer`] reads the
//! rendered rows and scrolls the list container by about one and a half
//! rows per step, so consecutive scans overlap and no row is skipped.
//!
//! Rows leave the DOM once they scroll out of view, so documents are
//! downloaded during the scan that first sees them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::browser::BrowserSession;
use crate::collect::Revealer;
use crate::error::SessionError;

const ROW: &str = "rds-list-item-row";
const SCROLLER: &str = "virtual-scroller.vertical.selfScroll";
const DOWNLOAD_BUTTON: &str = r#"button[icon="download"]"#;
const FROM_DATE: &str = r#"input[formcontrolname="fromDate"]"#;
const TO_DATE: &str = r#"input[formcontrolname="toDate"]"#;

/// Chrome writes into this subdirectory; finished files are moved up.
const STAGING_DIR: &str = ".incoming";

/// What to read from the mailbox.
#[derive(Debug, Clone, Default)]
pub struct DocumentQuery {
    pub from: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    /// Download every listed document into this directory.
    pub download_dir: Option<PathBuf>,
}

/// One row of the document list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRow {
    pub account: String,
    pub date: String,
    pub name: String,
    /// `aria-label` of the row's download button.
    pub label: String,
    /// Where the document was saved, when downloads are enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl DocumentRow {
    /// Composite identity. Rows have no id of their own.
    pub fn key(&self) -> String {
        format!("{}|{}|{}|{}", self.account, self.date, self.name, self.label)
    }

    fn download_selector(&self) -> String {
        format!(
            r#"{ROW} {DOWNLOAD_BUTTON}[aria-label="{}"]"#,
            self.label.replace('\\', "\\\\").replace('"', "\\\"")
        )
    }
}

fn scan_script() -> String {
    format!(
        r#"(() => Array.from(document.querySelectorAll('{ROW}')).flatMap(row => {{
            const button = row.querySelector('{DOWNLOAD_BUTTON}');
            if (!button) return [];
            const text = el => el ? (el.innerText || '').trim() : '';
            const meta = row.querySelectorAll('p.rds-body-normal');
            return [{{
                account: text(meta[1]),
                date: text(meta[0]),
                name: text(row.querySelector('p.rds-body-strong.dok-truncate-2-lines')),
                label: button.getAttribute('aria-label') || '',
            }}];
        }}))()"#
    )
}

fn scroll_script() -> String {
    format!(
        r#"(() => {{
            const scroller = document.querySelector('{SCROLLER}');
            if (!scroller) return false;
            const row = document.querySelector('{ROW}');
            const height = row ? row.getBoundingClientRect().height : 60;
            scroller.scrollBy(0, Math.max(height, 1) * 1.5);
            return true;
        }})()"#
    )
}

/// `name.pdf`, then `name (2).pdf`, `name (3).pdf`, ... whichever is free
/// on disk and not yet used in this run.
pub fn unique_path(dir: &Path, filename: &str, taken: &HashSet<String>) -> PathBuf {
    let free = |name: &str| !taken.contains(name) && !dir.join(name).exists();
    if free(filename) {
        return dir.join(filename);
    }
    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (filename, None),
    };
    (2..)
        .map(|n| match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        })
        .find(|name| free(name))
        .map(|name| dir.join(name))
        .unwrap_or_else(|| dir.join(filename))
}

fn list_files(dir: &Path) -> anyhow::Result<HashSet<PathBuf>> {
    Ok(std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect())
}

/// Wait for a finished file that was not in `before`.
async fn wait_for_new_file(
    dir: &Path,
    before: &HashSet<PathBuf>,
    timeout: Duration,
) -> anyhow::Result<PathBuf> {
    let poll = Duration::from_millis(250);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let finished = list_files(dir)?.into_iter().find(|path| {
            !before.contains(path)
                && !path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().ends_with(".crdownload"))
        });
        if let Some(path) = finished {
            return Ok(path);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("No download finished within {timeout:?}");
        }
        tokio::time::sleep(poll).await;
    }
}

struct Downloads {
    staging: PathBuf,
    output: PathBuf,
    timeout: Duration,
    handled: HashSet<String>,
    names: HashSet<String>,
}

impl Downloads {
    async fn fetch(
        &mut self,
        browser: &dyn BrowserSession,
        row: &DocumentRow,
    ) -> anyhow::Result<PathBuf> {
        let before = list_files(&self.staging)?;
        browser.click(&row.download_selector()).await?;
        let staged = wait_for_new_file(&self.staging, &before, self.timeout).await?;

        let suggested = staged
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.pdf", row.name));
        let target = unique_path(&self.output, &suggested, &self.names);
        std::fs::rename(&staged, &target)
            .with_context(|| format!("Failed to move download to {}", target.display()))?;
        if let Some(name) = target.file_name() {
            self.names.insert(name.to_string_lossy().into_owned());
        }
        Ok(target)
    }
}

/// [`Revealer`] over the mailbox's virtual-scroll list.
pub struct DocumentRevealer {
    browser: Arc<dyn BrowserSession>,
    settle: Duration,
    downloads: Option<Downloads>,
}

impl DocumentRevealer {
    pub fn new(browser: Arc<dyn BrowserSession>, settle: Duration) -> Self {
        Self {
            browser,
            settle,
            downloads: None,
        }
    }

    /// Download each newly seen document into `dir`, waiting at most
    /// `timeout` per file.
    pub async fn download_into(mut self, dir: &Path, timeout: Duration) -> Result<Self, SessionError> {
        let staging = dir.join(STAGING_DIR);
        std::fs::create_dir_all(&staging)
            .with_context(|| format!("Failed to create download dir: {}", staging.display()))?;
        self.browser.set_download_dir(&staging).await?;
        tracing::info!(dir = %dir.display(), "Saving documents");

        self.downloads = Some(Downloads {
            staging,
            output: dir.to_path_buf(),
            timeout,
            handled: HashSet::new(),
            names: HashSet::new(),
        });
        Ok(self)
    }

    /// Navigate to the mailbox, apply the date range and wait for rows.
    pub async fn open(
        &self,
        documents_url: &str,
        query: &DocumentQuery,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        self.browser.goto(documents_url).await?;
        if !self.browser.wait_for(ROW, timeout).await? {
            tracing::warn!(url = documents_url, "No document rows rendered");
        }
        self.apply_range(query).await;
        Ok(())
    }

    /// Fill the mailbox date inputs. A failure here only narrows nothing.
    async fn apply_range(&self, query: &DocumentQuery) {
        for (selector, date) in [(FROM_DATE, query.from), (TO_DATE, query.until)] {
            let Some(date) = date else { continue };
            let value = date.format("%d.%m.%Y").to_string();
            let result = async {
                self.browser.fill(selector, &value).await?;
                self.browser.press(selector, "Tab").await
            }
            .await;
            match result {
                Ok(()) => {
                    tracing::debug!(field = selector, %value, "Date filter set");
                    tokio::time::sleep(self.settle).await;
                }
                Err(e) => tracing::warn!(field = selector, error = %e, "Could not apply date filter"),
            }
        }
    }
}

#[async_trait]
impl Revealer<DocumentRow> for DocumentRevealer {
    async fn scan(&mut self) -> Result<Vec<DocumentRow>, SessionError> {
        let value = self.browser.evaluate(&scan_script()).await?;
        let mut rows: Vec<DocumentRow> =
            serde_json::from_value(value).context("Unexpected document row data")?;

        if let Some(downloads) = self.downloads.as_mut() {
            for row in rows.iter_mut() {
                if !downloads.handled.insert(row.key()) {
                    continue;
                }
                if row.label.is_empty() {
                    tracing::warn!(name = %row.name, "Document row without a download label");
                    continue;
                }
                match downloads.fetch(self.browser.as_ref(), row).await {
                    Ok(path) => {
                        tracing::info!(name = %row.name, file = %path.display(), "Downloaded document");
                        row.file = Some(path);
                        tokio::time::sleep(self.settle).await;
                    }
                    Err(e) => tracing::warn!(name = %row.name, error = %e, "Document download failed"),
                }
            }
        }
        Ok(rows)
    }

    async fn advance(&mut self) -> Result<(), SessionError> {
        let scrolled = self.browser.evaluate(&scroll_script()).await?;
        if scrolled == serde_json::Value::Bool(false) {
            tracing::debug!("Document scroller not found");
        }
        tokio::time::sleep(self.settle).await;
        Ok(())
    }
}
