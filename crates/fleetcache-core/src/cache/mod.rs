//! Local caching module for instant warm starts and offline display.
//!
//! This module provides the `TieredCache`, a memory tier in front of one JSON
//! file per dataset. Entries carry their capture time and are treated as
//! absent 24 hours after capture.
//!
//! Cached datasets:
//! - Device list (enriched)
//! - Aggregate stats
//! - Compliance grouped by policy
//! - Device location snapshot

pub mod manager;

pub use manager::{CacheAges, CacheError, CacheKey, CachedData, TieredCache, CACHE_EXPIRY_HOURS};
