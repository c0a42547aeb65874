//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! the tenant and app registration to sign in against, the Graph endpoint,
//! and the sync tunables.
//!
//! Configuration is stored at `~/.config/fleetcache/config.json`. The
//! `FLEETCACHE_TENANT_ID`, `FLEETCACHE_CLIENT_ID` and `FLEETCACHE_GRAPH_URL`
//! environment variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::DEFAULT_GRAPH_URL;
use crate::auth::{RetryPolicy, DEFAULT_AUTHORITY_HOST};

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "fleetcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Token cache file name inside the cache directory
const TOKEN_CACHE_FILE: &str = "token_cache.bin";

/// Below this fraction of located devices a cache hit triggers a
/// location-only refresh.
pub const DEFAULT_MIN_LOCATION_COVERAGE: f64 = 0.5;

pub const ENV_TENANT_ID: &str = "FLEETCACHE_TENANT_ID";
pub const ENV_CLIENT_ID: &str = "FLEETCACHE_CLIENT_ID";
pub const ENV_GRAPH_URL: &str = "FLEETCACHE_GRAPH_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub list_timeout_secs: u64,
    pub detail_timeout_secs: u64,
    pub enrichment_concurrency: usize,
    pub auth_max_attempts: u32,
    pub auth_backoff_base_secs: u64,
    pub cache_expiry_hours: i64,
    pub min_location_coverage: f64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            list_timeout_secs: 60,
            detail_timeout_secs: 10,
            enrichment_concurrency: crate::enrich::DEFAULT_CONCURRENCY,
            auth_max_attempts: 3,
            auth_backoff_base_secs: 2,
            cache_expiry_hours: crate::cache::CACHE_EXPIRY_HOURS,
            min_location_coverage: DEFAULT_MIN_LOCATION_COVERAGE,
        }
    }
}

impl SyncSettings {
    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }

    pub fn detail_timeout(&self) -> Duration {
        Duration::from_secs(self.detail_timeout_secs)
    }

    pub fn cache_expiry(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cache_expiry_hours)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.auth_max_attempts.max(1),
            base_delay: Duration::from_secs(self.auth_backoff_base_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub graph_url: String,
    pub authority_host: String,
    pub last_account: Option<String>,
    pub sync: SyncSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tenant_id: None,
            client_id: None,
            graph_url: DEFAULT_GRAPH_URL.to_string(),
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            last_account: None,
            sync: SyncSettings::default(),
        }
    }
}

impl Config {
    /// Load from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, contents)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Override file values with any variables `lookup` resolves.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(tenant) = set(ENV_TENANT_ID) {
            self.tenant_id = Some(tenant);
        }
        if let Some(client) = set(ENV_CLIENT_ID) {
            self.client_id = Some(client);
        }
        if let Some(url) = set(ENV_GRAPH_URL) {
            self.graph_url = url;
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn tenant_id(&self) -> Result<&str> {
        self.tenant_id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("No tenant configured; set {}", ENV_TENANT_ID))
    }

    pub fn client_id(&self) -> Result<&str> {
        self.client_id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("No client id configured; set {}", ENV_CLIENT_ID))
    }

    /// Per-tenant cache directory, `~/.cache/fleetcache/<tenant>`.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;

        let mut path = cache_dir.join(APP_NAME);
        if let Some(ref tenant) = self.tenant_id {
            path = path.join(tenant);
        }
        Ok(path)
    }

    pub fn token_cache_path(&self) -> Result<PathBuf> {
        Ok(self.cache_dir()?.join(TOKEN_CACHE_FILE))
    }
}
