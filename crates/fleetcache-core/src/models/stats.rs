use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::device::{is_sentinel_issue, DeviceRecord, UNKNOWN_COUNTRY};

/// Fleet-wide counts, recomputed from the device set on every sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct AggregateStats {
    pub total_devices: usize,
    pub compliant_devices: usize,
    pub non_compliant_devices: usize,
    pub by_device_type: BTreeMap<String, usize>,
    pub by_ownership: BTreeMap<String, usize>,
    pub by_operating_system: BTreeMap<String, usize>,
}

impl AggregateStats {
    pub fn from_devices(devices: &[DeviceRecord]) -> Self {
        let mut stats = AggregateStats {
            total_devices: devices.len(),
            ..Default::default()
        };

        for device in devices {
            if device.is_compliant() {
                stats.compliant_devices += 1;
            } else {
                stats.non_compliant_devices += 1;
            }
            *stats
                .by_device_type
                .entry(device.device_type.to_string())
                .or_default() += 1;
            *stats
                .by_ownership
                .entry(device.ownership.to_string())
                .or_default() += 1;

            let os = if device.operating_system.trim().is_empty() {
                "Unknown".to_string()
            } else {
                device.operating_system.trim().to_string()
            };
            *stats.by_operating_system.entry(os).or_default() += 1;
        }

        stats
    }

    /// Compliant share of the fleet in percent (0 for an empty fleet).
    pub fn compliance_rate(&self) -> f64 {
        if self.total_devices == 0 {
            return 0.0;
        }
        self.compliant_devices as f64 * 100.0 / self.total_devices as f64
    }
}

/// A device listed under a failing compliance policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct PolicyMember {
    pub device_id: String,
    pub device_name: String,
    pub owner: Option<String>,
}

/// Policy display name to the devices failing it.
pub type ComplianceByPolicy = BTreeMap<String, Vec<PolicyMember>>;

/// Group non-compliant devices by the policies they fail. Issues raised by
/// the sync engine itself (timeouts, failed lookups) are not policies and are
/// left out.
pub fn group_by_policy(devices: &[DeviceRecord]) -> ComplianceByPolicy {
    let mut groups = ComplianceByPolicy::new();
    for device in devices {
        for issue in &device.compliance_issues {
            if is_sentinel_issue(issue) {
                continue;
            }
            let members = groups.entry(issue.clone()).or_default();
            if members.iter().any(|m| m.device_id == device.id) {
                continue;
            }
            members.push(PolicyMember {
                device_id: device.id.clone(),
                device_name: device.display_name().to_string(),
                owner: device.owner.clone(),
            });
        }
    }
    groups
}

/// Per-country device counts for the geographic view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct LocationSnapshot {
    pub by_country: BTreeMap<String, usize>,
    /// Devices whose country is Unknown or not yet resolved.
    pub unresolved: usize,
}

impl LocationSnapshot {
    pub fn from_devices(devices: &[DeviceRecord]) -> Self {
        let mut snapshot = LocationSnapshot::default();
        for device in devices {
            match device.country.as_deref() {
                Some(country) if country != UNKNOWN_COUNTRY => {
                    *snapshot.by_country.entry(country.to_string()).or_default() += 1;
                }
                _ => snapshot.unresolved += 1,
            }
        }
        snapshot
    }

    pub fn country_count(&self) -> usize {
        self.by_country.len()
    }
}
