use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::collect::CollectorConfig;
use crate::credentials::CredentialConfig;
use crate::duration::{deserialize_duration, serialize_duration};

/// Browser launch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Run without a visible window. Login approval still works headless,
    /// since the one-time code is printed to the terminal.
    pub headless: bool,

    /// Persistent Chrome profile directory. Defaults to `<data_dir>/profile`.
    pub profile_dir: Option<PathBuf>,

    /// Explicit Chrome/Chromium binary; otherwise common locations are searched.
    pub chrome_executable: Option<PathBuf>,

    pub window_width: u32,
    pub window_height: u32,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            profile_dir: None,
            chrome_executable: None,
            window_width: 1280,
            window_height: 800,
        }
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

/// Upper bounds for every wait in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Pause after a navigation before inspecting the page.
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub page_settle: Duration,

    /// How long to wait for a single login form element to appear.
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub login_element: Duration,

    /// Interval between approval polls.
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub approval_poll: Duration,

    /// Ceiling for the out-of-band approval step.
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub approval_timeout: Duration,

    /// Ceiling for the network-capture token strategy, navigation included.
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub capture_timeout: Duration,

    /// Time given to the page to issue API calls after a capture navigation.
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub capture_settle: Duration,

    /// Per-request timeout for portal API calls.
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub request: Duration,

    /// Pause after each scroll step so lazy rows can render.
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub reveal_settle: Duration,

    /// How long a single mailbox document may take to download.
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub download: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            page_settle: secs(1),
            login_element: secs(10),
            approval_poll: secs(1),
            approval_timeout: secs(5 * 60),
            capture_timeout: secs(20),
            capture_settle: secs(3),
            request: secs(30),
            reveal_settle: secs(1),
            download: secs(30),
        }
    }
}

/// Collection limits and page sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Safety valve against server or logic defects, not a correctness bound.
    pub max_pages: usize,

    /// Consecutive scroll steps without new rows before a reveal stops.
    pub max_idle_reveals: usize,

    pub transactions_page_size: usize,
    pub documents_page_size: usize,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            max_pages: 500,
            max_idle_reveals: 20,
            transactions_page_size: 500,
            documents_page_size: 50,
        }
    }
}

impl CollectionConfig {
    pub fn collector(&self, page_size: Option<usize>) -> CollectorConfig {
        CollectorConfig {
            page_size,
            max_pages: self.max_pages,
            max_idle_reveals: self.max_idle_reveals,
        }
    }
}

/// Portal endpoints. Overridable so tests can point at a mock server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub login_url: String,
    pub dashboard_url: String,
    pub documents_url: String,

    /// Base URL that all REST paths are appended to.
    pub api_base: String,

    /// Host substring that indicates an authenticated page.
    pub authenticated_host: String,

    /// Host/path substrings that indicate the login flow.
    pub login_markers: Vec<String>,

    pub user_agent: String,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            login_url: "https://sso.raiffeisen.at/mein-login/identify".to_string(),
            dashboard_url:
                "https://mein.elba.raiffeisen.at/bankingws-widgetsystem/meine-produkte/dashboard"
                    .to_string(),
            documents_url:
                "https://mein.elba.raiffeisen.at/bankingws-widgetsystem/mailbox/dokumente"
                    .to_string(),
            api_base: "https://mein.elba.raiffeisen.at/api".to_string(),
            authenticated_host: "mein.elba.raiffeisen.at".to_string(),
            login_markers: vec!["sso.raiffeisen.at".to_string(), "mein-login".to_string()],
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15".to_string(),
        }
    }
}

impl PortalConfig {
    /// Whether `url` is on the login flow rather than inside the banking app.
    pub fn is_login_url(&self, url: &str) -> bool {
        self.login_markers.iter().any(|m| url.contains(m.as_str()))
    }

    pub fn is_authenticated_url(&self, url: &str) -> bool {
        url.contains(self.authenticated_host.as_str()) && !self.is_login_url(url)
    }
}

/// Application configuration, as written in `elbakit.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for the browser profile, token cache and debug dumps.
    /// If relative, resolved from the config file location.
    pub data_dir: Option<PathBuf>,

    /// Write raw API payloads to `<data_dir>/debug`.
    pub debug: bool,

    pub browser: BrowserConfig,
    pub timeouts: TimeoutConfig,
    pub collector: CollectionConfig,
    pub portal: PortalConfig,

    /// Where the user identifier and PIN come from. Defaults to a `.env` file
    /// in the data directory.
    pub credentials: Option<CredentialConfig>,
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load config from a file, or return default config if file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the data directory.
    ///
    /// Absolute paths are kept, relative ones are joined onto `config_dir`,
    /// and an unset value falls back to the platform data directory.
    pub fn resolve_data_dir(&self, config_dir: &Path) -> PathBuf {
        match &self.data_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => config_dir.join(dir),
            None => default_data_dir(),
        }
    }
}

/// Loaded configuration with resolved paths.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub data_dir: PathBuf,
    pub profile_dir: PathBuf,
    pub debug_dir: PathBuf,
    pub debug: bool,
    pub browser: BrowserConfig,
    pub timeouts: TimeoutConfig,
    pub collector: CollectionConfig,
    pub portal: PortalConfig,
    pub credentials: CredentialConfig,
}

impl ResolvedConfig {
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let config = Config::load_or_default(path)?;
        let config_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self::from_config(config, &config_dir))
    }

    pub fn from_config(config: Config, config_dir: &Path) -> Self {
        let data_dir = config.resolve_data_dir(config_dir);
        let profile_dir = config
            .browser
            .profile_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("profile"));
        let credentials = config
            .credentials
            .clone()
            .unwrap_or_else(|| CredentialConfig::File {
                path: data_dir.join(".env"),
            });

        Self {
            debug_dir: data_dir.join("debug"),
            profile_dir,
            data_dir,
            debug: config.debug,
            browser: config.browser,
            timeouts: config.timeouts,
            collector: config.collector,
            portal: config.portal,
            credentials,
        }
    }

    /// Token cache and last-URL marker live next to the browser profile.
    pub fn session_dir(&self) -> PathBuf {
        self.data_dir.join("session")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("elbakit"))
        .unwrap_or_else(|| PathBuf::from(".elbakit"))
}

/// Returns the default config file path.
///
/// Resolution order:
/// 1. `./elbakit.toml` if it exists in current directory
/// 2. `~/.config/elbakit/elbakit.toml`
pub fn default_config_path() -> PathBuf {
    let local_config = PathBuf::from("elbakit.toml");
    if local_config.exists() {
        return local_config;
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("elbakit").join("elbakit.toml");
    }

    local_config
}
