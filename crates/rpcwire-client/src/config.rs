//! Client configuration.
//!
//! Settings live in one TOML file, `~/.config/rpcwire/config.toml` by
//! default:
//!
//! ```toml
//! base_url = "https://notebooklm.google.com"
//! app = "LabsTailwindUi"
//! build_label = "boq_labs-tailwind-frontend_20250101.00_p0"
//! cookies = "env::RPCWIRE_COOKIES"
//!
//! [retry]
//! max_attempts = 4
//!
//! [refresh]
//! mode = "expiration"
//! margin_secs = 300
//!
//! [[quotas]]
//! kind = "audio_overview"
//! limit = 3
//! window = "daily"
//! ```
//!
//! `cookies` accepts secret references (see [`crate::secret`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng as _;
use rpcwire_protocol::{SessionParams, batch_path};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::RefreshStrategy;
use crate::error::{RpcError, RpcResult};
use crate::quota::QuotaRule;
use crate::secret;

/// Configuration for an [`RpcClient`](crate::RpcClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Origin of the web application.
    pub base_url: String,

    /// Application name in the batch endpoint path.
    pub app: String,

    /// Opaque build label sent as `bl`.
    pub build_label: String,

    /// Interface language sent as `hl`.
    pub locale: String,

    /// Signed-in account index sent as `authuser`.
    pub user_index: u32,

    /// Per-request timeout in seconds.
    pub timeout: u64,

    /// Cookie header value, or a secret reference to it.
    pub cookies: Option<String>,

    pub retry: RetryConfig,

    pub refresh: RefreshConfig,

    pub quotas: Vec<QuotaRule>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://notebooklm.google.com".to_string(),
            app: "LabsTailwindUi".to_string(),
            build_label: String::new(),
            locale: "en".to_string(),
            user_index: 0,
            timeout: 30,
            cookies: None,
            retry: RetryConfig::default(),
            refresh: RefreshConfig::default(),
            quotas: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Creates a configuration for the application at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Loads configuration from the default path, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> RpcResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> RpcResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RpcError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from TOML text.
    pub fn from_toml(content: &str) -> RpcResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| RpcError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rpcwire")
            .join("config.toml")
    }

    /// Checks values that would otherwise fail on first use.
    pub fn validate(&self) -> RpcResult<()> {
        self.homepage_url()?;
        if self.app.is_empty() {
            return Err(RpcError::Config("app must not be empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(RpcError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(RpcError::Config("retry.multiplier must be at least 1.0".into()));
        }
        if self.refresh.mode == RefreshMode::Expiration
            && self.refresh.margin_secs >= self.refresh.session_ttl_secs
        {
            return Err(RpcError::Config(format!(
                "refresh.margin_secs ({}) must be below refresh.session_ttl_secs ({})",
                self.refresh.margin_secs, self.refresh.session_ttl_secs
            )));
        }
        if let Some(rule) = self.quotas.iter().find(|rule| rule.kind.is_empty()) {
            return Err(RpcError::Config(format!(
                "quota rule with limit {} has no kind",
                rule.limit
            )));
        }
        Ok(())
    }

    /// Application homepage, used to refresh credentials.
    pub fn homepage_url(&self) -> RpcResult<Url> {
        Url::parse(&self.base_url)
            .map_err(|e| RpcError::Config(format!("invalid base_url {:?}: {}", self.base_url, e)))
    }

    /// Full URL of the batch endpoint.
    pub fn batch_url(&self) -> RpcResult<Url> {
        self.homepage_url()?
            .join(&batch_path(&self.app))
            .map_err(|e| RpcError::Config(format!("invalid batch endpoint: {}", e)))
    }

    /// Request parameters shared by every envelope.
    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            build_label: self.build_label.clone(),
            locale: self.locale.clone(),
            user_index: self.user_index,
        }
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Resolves the configured cookie header, expanding secret references.
    pub fn resolve_cookies(&self) -> RpcResult<String> {
        let value = self
            .cookies
            .as_deref()
            .ok_or_else(|| RpcError::Config("no cookies configured".into()))?;
        secret::resolve(value)
    }

    /// Builder: set the application name.
    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = app.into();
        self
    }

    /// Builder: set the build label.
    pub fn with_build_label(mut self, label: impl Into<String>) -> Self {
        self.build_label = label.into();
        self
    }

    /// Builder: set the cookie header or secret reference.
    pub fn with_cookies(mut self, cookies: impl Into<String>) -> Self {
        self.cookies = Some(cookies.into());
        self
    }

    /// Builder: set retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Builder: set refresh policy.
    pub fn with_refresh(mut self, refresh: RefreshConfig) -> Self {
        self.refresh = refresh;
        self
    }

    /// Builder: add a quota rule.
    pub fn with_quota(mut self, rule: QuotaRule) -> Self {
        self.quotas.push(rule);
        self
    }
}

/// Retry policy for transient HTTP failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per envelope, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Ceiling for any single delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Maximum jitter as a fraction of the delay (0.0-1.0).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter_fraction: 0.2,
        }
    }
}

impl RetryConfig {
    /// Creates a policy with `max_attempts` and default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Builder: set backoff parameters.
    pub fn with_backoff(mut self, initial: Duration, max: Duration, multiplier: f64) -> Self {
        self.initial_backoff_ms = initial.as_millis() as u64;
        self.max_backoff_ms = max.as_millis() as u64;
        self.multiplier = multiplier;
        self
    }

    /// Builder: set jitter fraction.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Backoff before retry number `retry` (1-based), without jitter.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_backoff_ms as f64 / 1000.0;
        let delay = base * self.multiplier.powi(retry as i32 - 1);
        let max = self.max_backoff().as_secs_f64();

        Duration::from_secs_f64(delay.min(max))
    }

    /// Backoff before retry number `retry`, with jitter, never above the ceiling.
    pub fn jittered_delay(&self, retry: u32) -> Duration {
        let base = self.backoff_delay(retry).as_secs_f64();
        let range = base * self.jitter_fraction.clamp(0.0, 1.0);
        let jitter = if range > 0.0 {
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };
        let delay = (base + jitter).clamp(0.0, self.max_backoff().as_secs_f64());
        Duration::from_secs_f64(delay)
    }

    /// Delay before retry number `retry`, preferring a server-requested one.
    pub fn delay_for(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(requested) => requested.min(self.max_backoff()),
            None => self.jittered_delay(retry),
        }
    }
}

/// How background credential refresh is scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Only refresh on demand, after the service rejects the session.
    Disabled,
    /// Refresh every `interval_secs`.
    Time,
    /// Refresh `margin_secs` before the estimated expiry.
    #[default]
    Expiration,
}

/// Credential refresh policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub mode: RefreshMode,
    /// Period of [`RefreshMode::Time`].
    pub interval_secs: u64,
    /// How long before the estimated expiry to refresh.
    pub margin_secs: u64,
    /// How often to re-check the expiry estimate.
    pub check_interval_secs: u64,
    /// Assumed lifetime of a session, used to estimate expiry.
    pub session_ttl_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            mode: RefreshMode::Expiration,
            interval_secs: 20 * 60,
            margin_secs: 5 * 60,
            check_interval_secs: 60,
            session_ttl_secs: 60 * 60,
        }
    }
}

impl RefreshConfig {
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs as i64)
    }

    /// The background strategy, or `None` when background refresh is off.
    pub fn strategy(&self) -> Option<RefreshStrategy> {
        match self.mode {
            RefreshMode::Disabled => None,
            RefreshMode::Time => Some(RefreshStrategy::TimeBased {
                interval: Duration::from_secs(self.interval_secs.max(1)),
            }),
            RefreshMode::Expiration => Some(RefreshStrategy::ExpirationBased {
                margin: Duration::from_secs(self.margin_secs),
                check_interval: Duration::from_secs(self.check_interval_secs.max(1)),
                session_ttl: self.session_ttl(),
            }),
        }
    }
}

/// Returns a per-attempt jitter-free delay sequence, for logging.
pub(crate) fn describe_backoff(retry: &RetryConfig) -> String {
    (1..retry.max_attempts)
        .map(|n| format!("{}ms", retry.backoff_delay(n).as_millis()))
        .collect::<Vec<_>>()
        .join(", ")
}
