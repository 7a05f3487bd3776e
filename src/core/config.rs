use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::ConfigError;
use super::types::Credentials;

// ---------------------------------------------------------------------------
// ScoutConfig: file-based config loader (gst-scout.json) with env-var fallback
// ---------------------------------------------------------------------------

pub const ENV_CONFIG_PATH: &str = "GST_SCOUT_CONFIG";
pub const ENV_PORTAL_BASE_URL: &str = "GST_PORTAL_BASE_URL";
pub const ENV_PORTAL_USERNAME: &str = "GST_PORTAL_USERNAME";
pub const ENV_PORTAL_PASSWORD: &str = "GST_PORTAL_PASSWORD";
pub const ENV_USE_SHARED_CREDENTIALS: &str = "GST_USE_SHARED_CREDENTIALS";
pub const ENV_CHROME_EXECUTABLE: &str = "CHROME_EXECUTABLE";
pub const ENV_HEADLESS: &str = "GST_SCOUT_HEADLESS";
pub const ENV_ASSEMBLYAI_API_KEY: &str = "ASSEMBLYAI_API_KEY";
pub const ENV_STORE_PATH: &str = "GST_SCOUT_STORE";
pub const ENV_REFRESH_SECS: &str = "GST_SCOUT_REFRESH_SECS";
pub const ENV_PORT: &str = "PORT";

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_flag(key: &str) -> Option<bool> {
    let v = env_nonempty(key)?.to_ascii_lowercase();
    match v.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn field_or_env(field: &Option<String>, key: &str) -> Option<String> {
    field
        .as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| env_nonempty(key))
}

/// Portal sub-config (mirrors the `portal` key in gst-scout.json).
#[derive(serde::Deserialize, Default, Clone)]
pub struct PortalConfig {
    /// Login page of the GST portal, e.g. `https://services.gst.gov.in/services/login`.
    pub base_url: Option<String>,
    /// Shared operator credential. Never logged.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Log in with the operator credential instead of per-taxpayer ones. Default: `true`.
    pub use_shared_credentials: Option<bool>,
}

impl std::fmt::Debug for PortalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("use_shared_credentials", &self.use_shared_credentials)
            .finish()
    }
}

impl PortalConfig {
    pub fn resolve_base_url(&self) -> Option<String> {
        field_or_env(&self.base_url, ENV_PORTAL_BASE_URL)
    }

    pub fn resolve_credentials(&self) -> Option<Credentials> {
        let username = field_or_env(&self.username, ENV_PORTAL_USERNAME)?;
        let password = field_or_env(&self.password, ENV_PORTAL_PASSWORD)?;
        Some(Credentials::new(username, password))
    }

    pub fn resolve_use_shared_credentials(&self) -> bool {
        self.use_shared_credentials
            .or_else(|| env_flag(ENV_USE_SHARED_CREDENTIALS))
            .unwrap_or(true)
    }

    /// Checks the fields a batch needs before any browser is launched.
    ///
    /// The base URL is always required; the operator credential only when
    /// `use_shared_credentials` is set.
    pub fn validate(&self, use_shared_credentials: bool) -> Result<PortalSettings, ConfigError> {
        let base_url = self.resolve_base_url();
        let username = field_or_env(&self.username, ENV_PORTAL_USERNAME);
        let password = field_or_env(&self.password, ENV_PORTAL_PASSWORD);

        let mut missing = Vec::new();
        if base_url.is_none() {
            missing.push("base URL");
        }
        if use_shared_credentials {
            if username.is_none() {
                missing.push("username");
            }
            if password.is_none() {
                missing.push("password");
            }
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingPortalSettings(missing));
        }

        let base_url = base_url.unwrap_or_default();
        if let Err(e) = url::Url::parse(&base_url) {
            return Err(ConfigError::InvalidBaseUrl {
                url: base_url,
                reason: e.to_string(),
            });
        }

        let shared_credentials = match (use_shared_credentials, username, password) {
            (true, Some(u), Some(p)) => Some(Credentials::new(u, p)),
            _ => None,
        };
        Ok(PortalSettings {
            base_url,
            shared_credentials,
        })
    }
}

/// Validated portal settings for one batch.
#[derive(Debug, Clone)]
pub struct PortalSettings {
    pub base_url: String,
    /// `Some` when every taxpayer logs in with the operator credential.
    pub shared_credentials: Option<Credentials>,
}

/// Browser sub-config.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct BrowserSection {
    pub executable: Option<String>,
    pub headless: Option<bool>,
}

impl BrowserSection {
    /// Executable: JSON field → `CHROME_EXECUTABLE` env var → `None` (auto-discovery).
    ///
    /// Only returns a path that exists.
    pub fn resolve_executable(&self) -> Option<String> {
        let p = field_or_env(&self.executable, ENV_CHROME_EXECUTABLE)?;
        if Path::new(&p).exists() {
            Some(p)
        } else {
            None
        }
    }

    pub fn resolve_headless(&self) -> bool {
        self.headless.or_else(|| env_flag(ENV_HEADLESS)).unwrap_or(true)
    }
}

/// How a batch fans out over its identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeMode {
    /// One identifier at a time; results arrive in processing order.
    Sequential,
    /// Up to `max_concurrent` isolated contexts at once, each with its own login.
    Pooled { max_concurrent: usize },
}

/// Scrape sub-config.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct ScrapeSection {
    pub captcha_attempts: Option<u32>,
    pub element_timeout_secs: Option<u64>,
    pub landing_timeout_secs: Option<u64>,
    pub probe_timeout_secs: Option<u64>,
    pub intercept_timeout_secs: Option<u64>,
    /// `"sequential"` (default) or `"pooled"`.
    pub mode: Option<String>,
    pub max_concurrent: Option<usize>,
    /// Where CAPTCHA audio is staged during transcription. Default: OS temp dir.
    pub scratch_dir: Option<PathBuf>,
}

impl ScrapeSection {
    pub fn resolve_timeouts(&self) -> PortalTimeouts {
        let d = PortalTimeouts::default();
        PortalTimeouts {
            element: self
                .element_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(d.element),
            landing: self
                .landing_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(d.landing),
            probe: self
                .probe_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(d.probe),
            intercept: self
                .intercept_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(d.intercept),
        }
    }

    pub fn resolve_captcha_attempts(&self) -> u32 {
        self.captcha_attempts.unwrap_or(3).max(1)
    }

    pub fn resolve_mode(&self) -> ScrapeMode {
        match self.mode.as_deref().map(|m| m.trim().to_ascii_lowercase()) {
            Some(m) if m == "pooled" => ScrapeMode::Pooled {
                max_concurrent: self.max_concurrent.unwrap_or(4).max(1),
            },
            _ => ScrapeMode::Sequential,
        }
    }

    pub fn resolve_scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("gst-scout"))
    }
}

/// Bounded waits used by the portal driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortalTimeouts {
    /// Form fields and menu entries.
    pub element: Duration,
    /// Dashboard detection after submitting the CAPTCHA.
    pub landing: Duration,
    /// Each narrower probe after a landing timeout.
    pub probe: Duration,
    /// A matched network response after its trigger.
    pub intercept: Duration,
}

impl Default for PortalTimeouts {
    fn default() -> Self {
        Self {
            element: Duration::from_secs(5),
            landing: Duration::from_secs(15),
            probe: Duration::from_secs(3),
            intercept: Duration::from_secs(20),
        }
    }
}

/// Due-date policy constants.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct PolicySection {
    pub monthly_grace_days: Option<u32>,
    pub annual_grace_days: Option<u32>,
}

impl PolicySection {
    pub fn resolve(&self) -> crate::returns::DuePolicy {
        let d = crate::returns::DuePolicy::default();
        crate::returns::DuePolicy {
            monthly_grace_days: self.monthly_grace_days.unwrap_or(d.monthly_grace_days),
            annual_grace_days: self.annual_grace_days.unwrap_or(d.annual_grace_days),
        }
    }
}

/// Speech-to-text provider sub-config.
#[derive(serde::Deserialize, Default, Clone)]
pub struct TranscriptionSection {
    /// Never logged.
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub max_polls: Option<u32>,
}

impl std::fmt::Debug for TranscriptionSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptionSection")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("base_url", &self.base_url)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("max_polls", &self.max_polls)
            .finish()
    }
}

impl TranscriptionSection {
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        field_or_env(&self.api_key, ENV_ASSEMBLYAI_API_KEY).ok_or(ConfigError::MissingTranscriptionKey)
    }

    pub fn resolve_base_url(&self) -> String {
        field_or_env(&self.base_url, "ASSEMBLYAI_BASE_URL")
            .unwrap_or_else(|| "https://api.assemblyai.com".to_string())
    }

    pub fn resolve_poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(1000))
    }

    pub fn resolve_max_polls(&self) -> u32 {
        self.max_polls.unwrap_or(60).max(1)
    }
}

/// Service-level settings of the binary.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct ServiceSection {
    pub store_path: Option<PathBuf>,
    pub refresh_interval_secs: Option<u64>,
    pub port: Option<u16>,
}

impl ServiceSection {
    /// Store: JSON field → `GST_SCOUT_STORE` → `~/.gst-scout/taxpayers.json`.
    pub fn resolve_store_path(&self) -> PathBuf {
        if let Some(p) = &self.store_path {
            return p.clone();
        }
        if let Some(p) = env_nonempty(ENV_STORE_PATH) {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".gst-scout")
            .join("taxpayers.json")
    }

    pub fn resolve_refresh_interval(&self) -> Duration {
        let secs = self
            .refresh_interval_secs
            .or_else(|| env_nonempty(ENV_REFRESH_SECS).and_then(|v| v.parse().ok()))
            .unwrap_or(86_400);
        Duration::from_secs(secs.max(60))
    }

    pub fn resolve_port(&self) -> u16 {
        self.port
            .or_else(|| env_nonempty(ENV_PORT).and_then(|v| v.parse().ok()))
            .unwrap_or(5080)
    }
}

/// Top-level config loaded from `gst-scout.json`.
#[derive(serde::Deserialize, Default, Clone, Debug)]
#[serde(default)]
pub struct ScoutConfig {
    pub portal: PortalConfig,
    pub browser: BrowserSection,
    pub scrape: ScrapeSection,
    pub policy: PolicySection,
    pub transcription: TranscriptionSection,
    pub service: ServiceSection,
}

/// Load `gst-scout.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `GST_SCOUT_CONFIG` env var path
/// 2. `./gst-scout.json`
/// 3. `../gst-scout.json`
///
/// Missing file → `ScoutConfig::default()` (all env-var fallbacks apply).
/// Parse error → log a warning, return `ScoutConfig::default()`.
pub fn load_scout_config() -> ScoutConfig {
    let mut candidates = vec![
        PathBuf::from("gst-scout.json"),
        PathBuf::from("../gst-scout.json"),
    ];
    if let Some(env_path) = env_nonempty(ENV_CONFIG_PATH) {
        candidates.insert(0, PathBuf::from(env_path));
    }

    for path in &candidates {
        let Ok(contents) = std::fs::read_to_string(path) else {
            continue;
        };
        return match parse_scout_config(&contents) {
            Ok(cfg) => {
                tracing::info!("gst-scout.json loaded from {}", path.display());
                cfg
            }
            Err(e) => {
                tracing::warn!(
                    "gst-scout.json parse error at {}: {}; using defaults",
                    path.display(),
                    e
                );
                ScoutConfig::default()
            }
        };
    }

    ScoutConfig::default()
}

pub fn parse_scout_config(contents: &str) -> Result<ScoutConfig, serde_json::Error> {
    serde_json::from_str(contents)
}
