//! Beacon configuration types, loading, and normalization
//!
//! Two layers: [`AppConfig`] is the raw, user-supplied shape (YAML file,
//! host-app overrides, remote config); [`Config`] is the validated snapshot
//! the core consumes. Normalization never fails for recoverable problems;
//! it clamps or substitutes and reports [`ConfigWarning`]s instead.

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Lower clamp for the session inactivity timeout (30 seconds)
pub const MIN_SESSION_TIMEOUT_MS: u64 = 30_000;

/// Upper clamp for the session inactivity timeout (24 hours)
pub const MAX_SESSION_TIMEOUT_MS: u64 = 86_400_000;

/// Default session inactivity timeout (15 minutes)
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 900_000;

/// Default outbound request timeout
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Default periodic flush interval
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 10_000;

/// Default retry budget per backend per batch (attempts = retries + 1)
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Operating mode for the SDK
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Normal delivery; invalid metadata is sanitized, not rejected
    #[default]
    Production,
    /// Events are logged instead of sent; metadata validation is strict
    Qa,
    /// Like production but with verbose diagnostics
    Debug,
}

impl Mode {
    /// Whether this mode suppresses network delivery
    pub fn is_qa(&self) -> bool {
        matches!(self, Mode::Qa)
    }
}

/// Raw configuration as supplied by the host application
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Project identifier; namespaces storage and cross-handle sync
    #[serde(rename = "project-id")]
    pub project_id: String,

    /// Collection backend URLs; events fan out to all of them
    #[serde(rename = "backend-urls")]
    pub backend_urls: Vec<String>,

    /// Optional remote config endpoint merged over the local settings
    #[serde(rename = "remote-config-url")]
    pub remote_config_url: Option<String>,

    /// Sampling rate in [0, 1]; unset or invalid normalizes to 1, 0 tracks nothing
    #[serde(rename = "sampling-rate")]
    pub sampling_rate: Option<f64>,

    /// Session inactivity timeout in milliseconds, clamped to [30s, 24h]
    #[serde(rename = "session-timeout-ms")]
    pub session_timeout_ms: Option<u64>,

    /// Glob patterns for page URL paths that must never be tracked
    #[serde(rename = "excluded-url-paths")]
    pub excluded_url_paths: Vec<String>,

    /// Operating mode
    pub mode: Mode,

    /// Stable user identifier, if the host app has one
    #[serde(rename = "user-id")]
    pub user_id: Option<String>,

    /// Device descriptor (e.g. "desktop", "mobile")
    pub device: Option<String>,

    /// Initial page URL
    #[serde(rename = "page-url")]
    pub page_url: Option<String>,

    /// Override for the storage directory (tests, sandboxed environments)
    #[serde(rename = "storage-dir")]
    pub storage_dir: Option<PathBuf>,

    /// Outbound request timeout in milliseconds
    #[serde(rename = "request-timeout-ms")]
    pub request_timeout_ms: Option<u64>,

    /// Periodic flush interval in milliseconds
    #[serde(rename = "flush-interval-ms")]
    pub flush_interval_ms: Option<u64>,

    /// Retries per backend per batch after the initial attempt
    #[serde(rename = "max-retries")]
    pub max_retries: Option<u32>,
}

impl AppConfig {
    /// Load configuration with fallback chain
    ///
    /// Explicit path → project-local `.beacon.yml` → user config dir →
    /// defaults. Only an explicit path that fails to load is an error.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".beacon.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("beacon").join("beacon.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Partial configuration served by a remote config endpoint
///
/// Only the fields present override the local values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub sampling_rate: Option<f64>,
    pub session_timeout_ms: Option<u64>,
    pub excluded_url_paths: Option<Vec<String>>,
    pub backend_urls: Option<Vec<String>>,
}

/// Validated configuration snapshot
///
/// Immutable for the lifetime of a session; a re-init replaces it wholesale.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_id: String,
    pub backend_urls: Vec<String>,
    pub sampling_rate: f64,
    pub session_timeout: Duration,
    pub excluded_url_patterns: Vec<glob::Pattern>,
    pub mode: Mode,
    pub user_id: Option<String>,
    pub device: Option<String>,
    pub page_url: Option<String>,
    pub storage_dir: Option<PathBuf>,
    pub request_timeout: Duration,
    pub flush_interval: Duration,
    pub max_retries: u32,
}

impl Config {
    /// Whether a page URL path matches any exclusion pattern
    pub fn is_url_excluded(&self, path: &str) -> bool {
        self.excluded_url_patterns.iter().any(|p| p.matches(path))
    }
}

/// Recoverable problems found while normalizing configuration
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWarning {
    /// Sampling rate outside [0, 1]; normalized to 1
    InvalidSamplingRate { given: f64 },
    /// Session timeout clamped into [30s, 24h]
    SessionTimeoutClamped { given_ms: u64, used_ms: u64 },
    /// Exclusion pattern failed to compile and was dropped
    InvalidExcludePattern { pattern: String },
    /// No backend URLs configured outside QA mode; nothing will be delivered
    NoBackends,
    /// Remote config could not be fetched; local values used
    RemoteFetchFailed { reason: String },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSamplingRate { given } => {
                write!(f, "sampling rate {given} is outside [0, 1]; using 1")
            }
            Self::SessionTimeoutClamped { given_ms, used_ms } => {
                write!(f, "session timeout {given_ms}ms clamped to {used_ms}ms")
            }
            Self::InvalidExcludePattern { pattern } => {
                write!(f, "excluded URL pattern {pattern:?} is not a valid glob; dropped")
            }
            Self::NoBackends => write!(f, "no backend URLs configured; events will not be delivered"),
            Self::RemoteFetchFailed { reason } => {
                write!(f, "remote config fetch failed ({reason}); using local config")
            }
        }
    }
}

/// Validate and normalize raw configuration
///
/// Never fails: every recoverable problem becomes a warning plus a safe
/// substitute value.
pub fn normalize(app: AppConfig) -> (Config, Vec<ConfigWarning>) {
    let mut warnings = Vec::new();

    // Zero is a valid rate (track nothing); negative, above-one, and NaN
    // rates normalize to 1 with a warning.
    let sampling_rate = match app.sampling_rate {
        None => 1.0,
        Some(rate) if (0.0..=1.0).contains(&rate) => rate,
        Some(given) => {
            warnings.push(ConfigWarning::InvalidSamplingRate { given });
            1.0
        }
    };

    let timeout_ms = app.session_timeout_ms.unwrap_or(DEFAULT_SESSION_TIMEOUT_MS);
    let clamped_ms = timeout_ms.clamp(MIN_SESSION_TIMEOUT_MS, MAX_SESSION_TIMEOUT_MS);
    if clamped_ms != timeout_ms {
        warnings.push(ConfigWarning::SessionTimeoutClamped {
            given_ms: timeout_ms,
            used_ms: clamped_ms,
        });
    }

    let mut excluded_url_patterns = Vec::new();
    for pattern in &app.excluded_url_paths {
        match glob::Pattern::new(pattern) {
            Ok(compiled) => excluded_url_patterns.push(compiled),
            Err(_) => warnings.push(ConfigWarning::InvalidExcludePattern {
                pattern: pattern.clone(),
            }),
        }
    }

    if app.backend_urls.is_empty() && !app.mode.is_qa() {
        warnings.push(ConfigWarning::NoBackends);
    }

    let config = Config {
        project_id: if app.project_id.is_empty() {
            "default".to_string()
        } else {
            app.project_id
        },
        backend_urls: app.backend_urls,
        sampling_rate,
        session_timeout: Duration::from_millis(clamped_ms),
        excluded_url_patterns,
        mode: app.mode,
        user_id: app.user_id,
        device: app.device,
        page_url: app.page_url,
        storage_dir: app.storage_dir,
        request_timeout: Duration::from_millis(app.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS)),
        flush_interval: Duration::from_millis(app.flush_interval_ms.unwrap_or(DEFAULT_FLUSH_INTERVAL_MS)),
        max_retries: app.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
    };

    (config, warnings)
}

/// Runtime QA switch
///
/// Config is an immutable snapshot, but `set_qa_mode` must take effect
/// immediately, so the effective QA state lives behind this shared flag.
/// Initialized from [`Mode::is_qa`] at init.
#[derive(Clone, Default)]
pub struct QaToggle(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl QaToggle {
    /// Create a toggle with the given initial state
    pub fn new(initial: bool) -> Self {
        Self(std::sync::Arc::new(std::sync::atomic::AtomicBool::new(initial)))
    }

    /// Flip QA mode at runtime
    pub fn set(&self, on: bool) {
        self.0.store(on, std::sync::atomic::Ordering::Relaxed);
    }

    /// Whether QA mode is currently active
    pub fn enabled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Remote+local configuration resolver
///
/// Fetches the remote overlay when configured, merges it over the local
/// values, and normalizes. Any fetch or decode failure degrades to the local
/// configuration with a warning; init is never blocked on remote config.
pub struct ConfigManager {
    http: reqwest::Client,
}

impl ConfigManager {
    /// Create a resolver with the given fetch timeout
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    /// Resolve the effective configuration for this init
    pub async fn get(&self, mut app: AppConfig) -> (Config, Vec<ConfigWarning>) {
        let mut fetch_warning = None;

        if let Some(url) = app.remote_config_url.clone() {
            match self.fetch(&url).await {
                Ok(remote) => {
                    debug!(%url, "remote config fetched");
                    if let Some(rate) = remote.sampling_rate {
                        app.sampling_rate = Some(rate);
                    }
                    if let Some(timeout) = remote.session_timeout_ms {
                        app.session_timeout_ms = Some(timeout);
                    }
                    if let Some(paths) = remote.excluded_url_paths {
                        app.excluded_url_paths = paths;
                    }
                    if let Some(urls) = remote.backend_urls {
                        app.backend_urls = urls;
                    }
                }
                Err(reason) => {
                    warn!(%url, %reason, "remote config fetch failed, using local config");
                    fetch_warning = Some(ConfigWarning::RemoteFetchFailed { reason });
                }
            }
        }

        let (config, mut warnings) = normalize(app);
        if let Some(warning) = fetch_warning {
            warnings.push(warning);
        }
        (config, warnings)
    }

    async fn fetch(&self, url: &str) -> Result<RemoteConfig, String> {
        let response = self.http.get(url).send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        response.json::<RemoteConfig>().await.map_err(|e| e.to_string())
    }
}
