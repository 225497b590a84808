//! Client configuration management.
//!
//! This module handles loading and saving the client configuration: the
//! remote host, locale, throttling and retry policy, proxies, harvest
//! concurrency and OTP timing.
//!
//! Configuration is stored at `~/.config/hubclient/config.json`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Application name used for config/data directory paths
const APP_NAME: &str = "hubclient";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Remote host every relative endpoint is resolved against.
pub const DEFAULT_HOST: &str = "https://www.pornhub.com/";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    /// Value of the `Accept-Language` header sent with every call.
    pub locale: String,
    pub timeout_secs: u64,
    /// Minimum delay before every call except the first one.
    pub delay_ms: u64,
    /// Scheme (`http`, `https`, `all`) to proxy URL.
    pub proxies: BTreeMap<String, String>,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub harvest_concurrency: usize,
    /// Stored batches kept per category by the file sink.
    pub batch_retention: usize,
    pub otp_interval_secs: u64,
    pub otp_wait_threshold_secs: u64,
    /// Cookies seeded into every fresh session.
    pub bootstrap_cookies: BTreeMap<String, String>,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let bootstrap_cookies = [
            ("accessAgeDisclaimerPH", "1"),
            ("accessAgeDisclaimerUK", "1"),
            ("accessPH", "1"),
            ("age_verified", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            host: DEFAULT_HOST.to_string(),
            locale: "en,en-US".to_string(),
            timeout_secs: 30,
            delay_ms: 0,
            proxies: BTreeMap::new(),
            max_attempts: 4,
            backoff_ms: 3000,
            harvest_concurrency: 8,
            batch_retention: 10,
            otp_interval_secs: 30,
            otp_wait_threshold_secs: 3,
            bootstrap_cookies,
            last_username: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
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

    /// Directory holding harvested batches and the credential vault.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn otp_interval(&self) -> Duration {
        Duration::from_secs(self.otp_interval_secs)
    }

    pub fn otp_wait_threshold(&self) -> Duration {
        Duration::from_secs(self.otp_wait_threshold_secs)
    }
}
