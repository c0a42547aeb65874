use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Cache entries expire 24 hours after capture.
pub const CACHE_EXPIRY_HOURS: i64 = 24;

// ============================================================================
// Keys and entries
// ============================================================================

/// Logical datasets held by the cache. Each one expires and is cleared
/// independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Devices,
    Stats,
    ComplianceByPolicy,
    DeviceLocations,
}

impl CacheKey {
    pub const ALL: [CacheKey; 4] = [
        CacheKey::Devices,
        CacheKey::Stats,
        CacheKey::ComplianceByPolicy,
        CacheKey::DeviceLocations,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CacheKey::Devices => "devices",
            CacheKey::Stats => "stats",
            CacheKey::ComplianceByPolicy => "compliance-by-policy",
            CacheKey::DeviceLocations => "device-locations",
        }
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to serialize cache entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Cache entry '{key}' is corrupt: {reason}")]
    Corrupt { key: &'static str, reason: String },
}

/// On-disk envelope: payload plus the instant it was captured from the
/// remote system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    pub fn captured_at(data: T, cached_at: DateTime<Utc>) -> Self {
        Self { data, cached_at }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Negative ages come from clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }

    /// Valid while `now - cached_at <= expiry`.
    pub fn is_valid_at(&self, now: DateTime<Utc>, expiry: Duration) -> bool {
        now - self.cached_at <= expiry
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CachedData<U> {
        CachedData {
            data: f(self.data),
            cached_at: self.cached_at,
        }
    }
}

// ============================================================================
// Tiered cache
// ============================================================================

/// Two-tier keyed store: a process-lifetime memory tier in front of one JSON
/// file per dataset. Reads go memory first, then disk, promoting disk hits.
/// Writes are last-writer-wins and reach disk through write-then-rename;
/// the memory tier only changes once the file is in place.
pub struct TieredCache {
    cache_dir: PathBuf,
    expiry: Duration,
    memory: RwLock<HashMap<CacheKey, CachedData<Value>>>,
    /// Serializes commits so memory and disk agree on the last writer.
    writes: Mutex<()>,
    write_seq: AtomicU64,
}

impl TieredCache {
    pub fn new(cache_dir: PathBuf) -> Result<Self, CacheError> {
        Self::with_expiry(cache_dir, Duration::hours(CACHE_EXPIRY_HOURS))
    }

    pub fn with_expiry(cache_dir: PathBuf, expiry: Duration) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            expiry,
            memory: RwLock::new(HashMap::new()),
            writes: Mutex::new(()),
            write_seq: AtomicU64::new(0),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    fn cache_path(&self, key: CacheKey) -> PathBuf {
        self.cache_dir.join(format!("{}.json", key.name()))
    }

    /// A temp file no other write uses, in this process or another one.
    fn temp_path(&self, key: CacheKey) -> PathBuf {
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        self.cache_dir
            .join(format!("{}.json.{}-{}.tmp", key.name(), std::process::id(), seq))
    }

    /// Return the entry for `key` if it is within the expiry window.
    /// Expired, missing and unreadable entries are all misses.
    pub async fn get<T: DeserializeOwned>(&self, key: CacheKey) -> Option<CachedData<T>> {
        let entry = self.lookup(key).await?;
        if !entry.is_valid_at(Utc::now(), self.expiry) {
            debug!(cache = key.name(), cached_at = %entry.cached_at, "Cache entry expired");
            return None;
        }
        Self::decode(key, entry)
    }

    /// Return the entry for `key` regardless of age. Only for callers that
    /// explicitly accept stale data, e.g. to keep showing something after a
    /// failed refresh.
    pub async fn get_stale<T: DeserializeOwned>(&self, key: CacheKey) -> Option<CachedData<T>> {
        let entry = self.lookup(key).await?;
        Self::decode(key, entry)
    }

    /// Store `data` under `key`, captured now.
    pub async fn put<T: Serialize>(&self, key: CacheKey, data: &T) -> Result<(), CacheError> {
        self.put_captured_at(key, data, Utc::now()).await
    }

    /// Store `data` under `key` with an explicit capture time.
    pub async fn put_captured_at<T: Serialize>(
        &self,
        key: CacheKey,
        data: &T,
        cached_at: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let entry = CachedData::captured_at(serde_json::to_value(data)?, cached_at);
        let contents = serde_json::to_string_pretty(&entry)?;

        let _commit = self.writes.lock().await;
        let temp_path = self.temp_path(key);
        if let Err(e) = Self::write_file(&temp_path, &self.cache_path(key), contents).await {
            if let Err(cleanup) = tokio::fs::remove_file(&temp_path).await {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(path = %temp_path.display(), error = %cleanup, "Failed to remove temp cache file");
                }
            }
            return Err(e.into());
        }

        self.memory.write().await.insert(key, entry);
        debug!(cache = key.name(), "Cache entry written");
        Ok(())
    }

    async fn write_file(temp_path: &Path, path: &Path, contents: String) -> io::Result<()> {
        tokio::fs::write(temp_path, contents).await?;
        tokio::fs::rename(temp_path, path).await
    }

    /// Remove `key` from both tiers.
    pub async fn clear(&self, key: CacheKey) -> Result<(), CacheError> {
        let _commit = self.writes.lock().await;
        self.memory.write().await.remove(&key);
        match tokio::fs::remove_file(self.cache_path(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(cache = key.name(), "Cache entry cleared");
        Ok(())
    }

    /// Remove every dataset from both tiers. Keeps going past individual
    /// failures and reports the first one.
    pub async fn clear_all(&self) -> Result<(), CacheError> {
        let mut first_error = None;
        for key in CacheKey::ALL {
            if let Err(e) = self.clear(key).await {
                warn!(cache = key.name(), error = %e, "Failed to clear cache entry");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Age display per dataset, ignoring expiry.
    pub async fn ages(&self) -> CacheAges {
        let mut ages = CacheAges::default();
        for key in CacheKey::ALL {
            let age = self.lookup(key).await.map(|entry| entry.age_display());
            match key {
                CacheKey::Devices => ages.devices = age,
                CacheKey::Stats => ages.stats = age,
                CacheKey::ComplianceByPolicy => ages.compliance_by_policy = age,
                CacheKey::DeviceLocations => ages.device_locations = age,
            }
        }
        ages
    }

    async fn lookup(&self, key: CacheKey) -> Option<CachedData<Value>> {
        if let Some(entry) = self.memory.read().await.get(&key) {
            return Some(entry.clone());
        }

        // Promotion must not race a commit or clear of the same key
        let _commit = self.writes.lock().await;
        if let Some(entry) = self.memory.read().await.get(&key) {
            return Some(entry.clone());
        }

        match self.load_from_disk(key).await {
            Ok(Some(entry)) => {
                debug!(cache = key.name(), "Promoting disk cache entry to memory");
                self.memory.write().await.insert(key, entry.clone());
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(cache = key.name(), error = %e, "Ignoring unreadable cache entry");
                None
            }
        }
    }

    async fn load_from_disk(&self, key: CacheKey) -> Result<Option<CachedData<Value>>, CacheError> {
        let contents = match tokio::fs::read_to_string(self.cache_path(key)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| CacheError::Corrupt {
                key: key.name(),
                reason: e.to_string(),
            })
    }

    fn decode<T: DeserializeOwned>(key: CacheKey, entry: CachedData<Value>) -> Option<CachedData<T>> {
        let cached_at = entry.cached_at;
        match serde_json::from_value(entry.data) {
            Ok(data) => Some(CachedData::captured_at(data, cached_at)),
            Err(e) => {
                let err = CacheError::Corrupt {
                    key: key.name(),
                    reason: e.to_string(),
                };
                warn!(error = %err, "Cache payload does not match the expected shape");
                None
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CacheAges {
    pub devices: Option<String>,
    pub stats: Option<String>,
    pub compliance_by_policy: Option<String>,
    pub device_locations: Option<String>,
}

impl CacheAges {
    /// Age of the device list, which every other view is derived from.
    pub fn last_updated(&self) -> String {
        self.devices
            .clone()
            .or_else(|| self.stats.clone())
            .unwrap_or_else(|| "never".to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
