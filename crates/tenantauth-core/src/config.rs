//! Session configuration.
//!
//! Loaded from `~/.config/tenantauth/config.json` when present; every field
//! has a default, so a partial file only overrides what it names. The API
//! base URL can also be set through `TENANTAUTH_API_URL`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "tenantauth";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding `api_base_url`
pub const API_URL_ENV: &str = "TENANTAUTH_API_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub api_base_url: String,
    pub redirect_uri: Option<String>,
    /// HTTP request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Refresh once the token is this close to expiry (5 minutes).
    pub refresh_threshold_secs: u64,
    /// Cadence of the proactive refresh check.
    pub refresh_check_interval_secs: u64,
    /// Log out after this long without user interaction (30 minutes).
    pub idle_timeout_secs: u64,
    /// Cadence of the idle check (5 minutes).
    pub idle_check_interval_secs: u64,
    /// When false, activity is still stamped but never enforced.
    pub idle_timeout_enabled: bool,
    /// How many consumed authorization codes to remember.
    pub code_ledger_capacity: usize,
    /// Header carrying the tenant id on outbound requests.
    pub tenant_header: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api".to_string(),
            redirect_uri: None,
            request_timeout_secs: 30,
            refresh_threshold_secs: 5 * 60,
            refresh_check_interval_secs: 60,
            idle_timeout_secs: 30 * 60,
            idle_check_interval_secs: 5 * 60,
            idle_timeout_enabled: true,
            code_ledger_capacity: 64,
            tenant_header: "X-Tenant-ID".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config: Self = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };

        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                config.api_base_url = url.trim().to_string();
            }
        }
        Ok(config)
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

    /// Directory holding the sealed session record.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn refresh_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_threshold_secs as i64)
    }

    pub fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_timeout_secs as i64)
    }

    pub fn refresh_check_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_check_interval_secs.max(1))
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs.max(1))
    }
}
