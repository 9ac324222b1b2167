//! Client configuration.
//!
//! [`ClientConfig`] carries every tunable of the client. Defaults come from
//! [`crate::constants`]; a RON file may override any subset:
//!
//! ```ron
//! (
//!     hub_url: "wss://chat.example.edu/chathub",
//!     api_base_url: "https://chat.example.edu/api",
//!     request_timeout_ms: 10000,
//!     retry: (initial_ms: 2000, max_ms: 30000, multiplier: 2.0, jitter: 0.2),
//! )
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::constants::{
    BACKOFF_JITTER, BACKOFF_MULTIPLIER, CONNECT_TIMEOUT, DEFAULT_API_BASE_URL, DEFAULT_HUB_URL,
    ECHO_TOLERANCE, INITIAL_BACKOFF, KEEPALIVE_INTERVAL, MAX_BACKOFF, REQUEST_TIMEOUT,
};

/// Reconnect delay schedule.
///
/// `delay_for(1)` is the wait before the first retry. Each later attempt
/// multiplies the base delay by `multiplier`, capped at `max`, then applies up
/// to `±jitter` of random spread.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl RetryPolicy {
    /// Doubling delays with the default jitter.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: BACKOFF_MULTIPLIER,
            jitter: BACKOFF_JITTER,
        }
    }

    /// The same delay before every retry, no jitter.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            max: interval,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = scaled.min(self.max.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay before retry number `attempt` (1-based), with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor).min(self.max)
    }
}

/// Everything the client needs to reach the backend.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hub WebSocket endpoint; the user id is appended as a query parameter.
    pub hub_url: String,
    /// REST base, e.g. `https://host/api`.
    pub api_base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
    pub echo_tolerance: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hub_url: DEFAULT_HUB_URL.into(),
            api_base_url: DEFAULT_API_BASE_URL.into(),
            connect_timeout: CONNECT_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            echo_tolerance: ECHO_TOLERANCE,
            retry: RetryPolicy::default(),
        }
    }
}

/// Error type for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// On-disk shape: every field optional, durations in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    hub_url: Option<String>,
    api_base_url: Option<String>,
    connect_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    keepalive_interval_ms: Option<u64>,
    echo_tolerance_ms: Option<u64>,
    retry: Option<RetryFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RetryFile {
    initial_ms: Option<u64>,
    max_ms: Option<u64>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
}

impl ClientConfig {
    /// Parse RON text, layering it over the defaults.
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .from_str(text)?;
        let mut config = Self::default();

        if let Some(url) = file.hub_url {
            config.hub_url = url;
        }
        if let Some(url) = file.api_base_url {
            config.api_base_url = url;
        }
        if let Some(ms) = file.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.request_timeout_ms {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.keepalive_interval_ms {
            config.keepalive_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = file.echo_tolerance_ms {
            config.echo_tolerance = Duration::from_millis(ms);
        }
        if let Some(retry) = file.retry {
            if let Some(ms) = retry.initial_ms {
                config.retry.initial = Duration::from_millis(ms);
            }
            if let Some(ms) = retry.max_ms {
                config.retry.max = Duration::from_millis(ms);
            }
            if let Some(m) = retry.multiplier {
                config.retry.multiplier = m;
            }
            if let Some(j) = retry.jitter {
                config.retry.jitter = j;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a RON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron_str(&text)
    }

    /// Default config file location (`~/.config/huddle/client.ron`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("huddle").join("client.ron"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.hub_url.starts_with("ws://") || self.hub_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "hub_url must be ws:// or wss://, got {}",
                self.hub_url
            )));
        }
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://"))
        {
            return Err(ConfigError::Invalid(format!(
                "api_base_url must be http:// or https://, got {}",
                self.api_base_url
            )));
        }
        if self.retry.initial.is_zero() {
            return Err(ConfigError::Invalid("retry.initial_ms must be > 0".into()));
        }
        if self.retry.max < self.retry.initial {
            return Err(ConfigError::Invalid("retry.max_ms must be >= retry.initial_ms".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid("retry.jitter must be within 0.0..=1.0".into()));
        }
        if self.request_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be > 0".into()));
        }
        Ok(())
    }
}
