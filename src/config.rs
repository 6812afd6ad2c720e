use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{AppError, AppResult};

/// Prefix of environment variables that override configuration keys.
/// Nested keys use `__`, e.g. `PAGESCRIPTS_FETCH__TIMEOUT_MS`.
pub const ENV_PREFIX: &str = "PAGESCRIPTS_";

/// Configuration for the script manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding `scripts.json` and `dependencies.json`
    pub data_dir: PathBuf,
    /// Page the managed scripts are injected into
    pub target_url: String,
    pub fetch: FetchConfig,
    pub injection: InjectionConfig,
    pub auto_update: AutoUpdateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_ms: u64,
    pub max_script_bytes: usize,
    pub user_agent: String,
    /// Accept plain `http://` URLs (local development and tests only)
    pub allow_insecure_http: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    /// Upper bound on the wait for the page's content anchor
    pub anchor_timeout_ms: u64,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoUpdateConfig {
    pub enabled: bool,
    /// Skip scripts fetched successfully less than this many seconds ago
    pub min_interval_secs: u64,
    /// Skip scripts whose last attempt failed less than this many seconds ago
    pub error_backoff_secs: u64,
    pub concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            target_url: "https://www.geoguessr.com/".to_string(),
            fetch: FetchConfig::default(),
            injection: InjectionConfig::default(),
            auto_update: AutoUpdateConfig::default(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_script_bytes: 10 * 1024 * 1024,
            user_agent: format!("pagescripts/{}", env!("CARGO_PKG_VERSION")),
            allow_insecure_http: false,
        }
    }
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            anchor_timeout_ms: 10_000,
            poll_initial_ms: 1,
            poll_max_ms: 50,
        }
    }
}

impl Default for AutoUpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_secs: 0,
            error_backoff_secs: 0,
            concurrency: 4,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs_next::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pagescripts")
}

impl Config {
    /// Load configuration from defaults, an optional TOML file and the environment
    pub fn load(file: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Create config from environment variables only
    pub fn from_env() -> AppResult<Self> {
        Self::load(None)
    }

    /// Configuration for tests: local HTTP allowed and short timeouts
    pub fn test_config(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            target_url: "https://page.test/".to_string(),
            fetch: FetchConfig {
                timeout_ms: 2_000,
                allow_insecure_http: true,
                ..FetchConfig::default()
            },
            injection: InjectionConfig {
                anchor_timeout_ms: 1_000,
                ..InjectionConfig::default()
            },
            auto_update: AutoUpdateConfig::default(),
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.fetch.timeout_ms == 0 {
            return Err(AppError::config_validation(
                "fetch.timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.fetch.max_script_bytes == 0 {
            return Err(AppError::config_validation(
                "fetch.max_script_bytes",
                "must be greater than zero",
            ));
        }
        if let Err(e) = Url::parse(&self.target_url) {
            return Err(AppError::config_validation("target_url", e.to_string()));
        }
        if self.injection.poll_initial_ms == 0 {
            return Err(AppError::config_validation(
                "injection.poll_initial_ms",
                "must be greater than zero",
            ));
        }
        if self.injection.poll_initial_ms > self.injection.poll_max_ms {
            return Err(AppError::config_validation(
                "injection.poll_initial_ms",
                "must not exceed injection.poll_max_ms",
            ));
        }
        if self.auto_update.concurrency == 0 {
            return Err(AppError::config_validation(
                "auto_update.concurrency",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn target_url(&self) -> AppResult<Url> {
        Url::parse(&self.target_url)
            .map_err(|e| AppError::config_validation("target_url", e.to_string()))
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl InjectionConfig {
    pub fn anchor_timeout(&self) -> Duration {
        Duration::from_millis(self.anchor_timeout_ms)
    }
}
