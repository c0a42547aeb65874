//! Data models for managed-device compliance.
//!
//! This module contains the structures the sync engine moves between the
//! remote API, the enrichment pass and the cache:
//!
//! - `DeviceRecord`: one managed device with its compliance issues and country
//! - `AggregateStats`, `LocationSnapshot`, `ComplianceByPolicy`: derived views
//! - `ConfigProfile`: per-device configuration profile state

pub mod device;
pub mod profile;
pub mod stats;

pub use device::{
    classify_device_type, is_sentinel_issue, location_coverage, ComplianceState, DeviceRecord,
    DeviceType, OwnershipType, FAILED_CHECK_PREFIX, PENDING_DETAIL_ISSUE, TIMED_OUT_ISSUE,
    UNKNOWN_COUNTRY,
};
pub use profile::ConfigProfile;
pub use stats::{group_by_policy, AggregateStats, ComplianceByPolicy, LocationSnapshot, PolicyMember};
