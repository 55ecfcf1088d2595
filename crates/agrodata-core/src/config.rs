//! Application configuration management.
//!
//! Two layers:
//! - `ApiConfig`: network settings (base URL, timeout, retry policy),
//!   overridable from the environment with fixed defaults.
//! - `Config`: user preferences persisted as JSON at
//!   `~/.config/agrodata/config.json` (last email, token backend).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::RetryPolicy;

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "agrodata";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_BASE_URL: &str = "http://localhost:5142/api";
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// Background session re-validation period (5 minutes).
pub const DEFAULT_REVALIDATE_SECS: u64 = 300;

pub const ENV_BASE_URL: &str = "AGRODATA_API_BASE_URL";
pub const ENV_TIMEOUT: &str = "AGRODATA_API_TIMEOUT";
pub const ENV_RETRY_ATTEMPTS: &str = "AGRODATA_API_RETRY_ATTEMPTS";
pub const ENV_RETRY_DELAY: &str = "AGRODATA_API_RETRY_DELAY";
pub const ENV_REVALIDATE_INTERVAL: &str = "AGRODATA_REVALIDATE_INTERVAL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub revalidate_interval: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            revalidate_interval: Duration::from_secs(DEFAULT_REVALIDATE_SECS),
        }
    }
}

impl ApiConfig {
    /// Defaults overridden by any `AGRODATA_*` variables in the process env.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let base_url = lookup(ENV_BASE_URL)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.base_url);

        Self {
            base_url: normalize_base_url(&base_url),
            timeout: parse_var(&lookup, ENV_TIMEOUT)
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            retry_attempts: parse_var(&lookup, ENV_RETRY_ATTEMPTS)
                .unwrap_or(defaults.retry_attempts),
            retry_base_delay: parse_var(&lookup, ENV_RETRY_DELAY)
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            revalidate_interval: parse_var(&lookup, ENV_REVALIDATE_INTERVAL)
                .map(Duration::from_secs)
                .unwrap_or(defaults.revalidate_interval),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = normalize_base_url(base_url);
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_base_delay)
    }

    /// Join the base URL and an endpoint path.
    pub fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = key, value = %raw, "Ignoring unparseable configuration value");
            None
        }
    }
}

/// Where the session credentials are kept between runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenBackend {
    #[default]
    File,
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub last_email: Option<String>,
    #[serde(default)]
    pub token_backend: TokenBackend,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for the file-backed token store.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }
}
