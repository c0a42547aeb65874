use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder issue carried by a device the remote API reports as
/// non-compliant until enrichment fetches the real policy names.
pub const PENDING_DETAIL_ISSUE: &str = "Non-compliant (details pending)";

/// Issue recorded when the per-device compliance lookup exceeds its budget.
pub const TIMED_OUT_ISSUE: &str = "Compliance check timed out";

/// Prefix of the issue recorded when the per-device compliance lookup fails.
pub const FAILED_CHECK_PREFIX: &str = "Compliance check failed";

/// Country assigned when an owner's location is empty or unresolvable.
/// Devices carrying it are left out of geographic aggregation.
pub const UNKNOWN_COUNTRY: &str = "Unknown";

/// Returns true for issue strings produced by the sync engine itself rather
/// than by a remote compliance policy.
pub fn is_sentinel_issue(issue: &str) -> bool {
    issue == PENDING_DETAIL_ISSUE || issue == TIMED_OUT_ISSUE || issue.starts_with(FAILED_CHECK_PREFIX)
}

// ============================================================================
// Device classification
// ============================================================================

/// Normalized device class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Mobile,
    Unknown,
    /// Operating system family we have no mapping for, kept verbatim.
    Other(String),
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Desktop => write!(f, "Desktop"),
            DeviceType::Laptop => write!(f, "Laptop"),
            DeviceType::Mobile => write!(f, "Mobile"),
            DeviceType::Unknown => write!(f, "Unknown"),
            DeviceType::Other(os) => write!(f, "{}", os),
        }
    }
}

/// OS families that are always handhelds. Checked before the desktop
/// families so "Windows Mobile" never lands in the Windows bucket.
const MOBILE_OS_PREFIXES: &[&str] = &[
    "ios",
    "ipados",
    "android",
    "windows mobile",
    "windows phone",
    "windowsmobile",
];

/// OS families that run on desktops and laptops.
const DESKTOP_OS_PREFIXES: &[&str] = &[
    "windows",
    "macos",
    "mac os",
    "macmdm",
    "linux",
    "ubuntu",
    "chrome os",
    "chromeos",
];

/// Model substrings that identify a portable machine.
const LAPTOP_MODEL_HINTS: &[&str] = &[
    "macbook",
    "laptop",
    "notebook",
    "thinkpad",
    "latitude",
    "elitebook",
    "probook",
    "zbook",
    "surface book",
    "surface pro",
    "surface go",
    "xps",
    "yoga",
    "spectre",
    "chromebook",
];

/// Map an OS family string (and model, to split desktops from laptops) to
/// the normalized device type.
pub fn classify_device_type(operating_system: &str, model: &str) -> DeviceType {
    let os = operating_system.trim();
    if os.is_empty() {
        return DeviceType::Unknown;
    }

    let os_lower = os.to_lowercase();
    if os_lower == "unknown" {
        return DeviceType::Unknown;
    }
    if MOBILE_OS_PREFIXES.iter().any(|p| os_lower.starts_with(p)) {
        return DeviceType::Mobile;
    }
    if DESKTOP_OS_PREFIXES.iter().any(|p| os_lower.starts_with(p)) {
        let model_lower = model.to_lowercase();
        if LAPTOP_MODEL_HINTS.iter().any(|h| model_lower.contains(h)) {
            return DeviceType::Laptop;
        }
        return DeviceType::Desktop;
    }

    DeviceType::Other(os.to_string())
}

// ============================================================================
// Ownership and reported compliance
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "snake_case")]
pub enum OwnershipType {
    Company,
    Personal,
    Unknown,
}

impl OwnershipType {
    pub fn from_remote(s: Option<&str>) -> Self {
        match s.map(|v| v.trim().to_lowercase()).as_deref() {
            Some("company") | Some("corporate") => OwnershipType::Company,
            Some("personal") => OwnershipType::Personal,
            _ => OwnershipType::Unknown,
        }
    }
}

impl fmt::Display for OwnershipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnershipType::Company => write!(f, "Corporate"),
            OwnershipType::Personal => write!(f, "Personal"),
            OwnershipType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Compliance state as reported by the remote management service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "snake_case")]
pub enum ComplianceState {
    Compliant,
    NonCompliant,
    Conflict,
    Error,
    InGracePeriod,
    ConfigManager,
    Unknown,
}

impl ComplianceState {
    pub fn from_remote(s: Option<&str>) -> Self {
        match s.map(|v| v.trim().to_lowercase()).as_deref() {
            Some("compliant") => ComplianceState::Compliant,
            Some("noncompliant") => ComplianceState::NonCompliant,
            Some("conflict") => ComplianceState::Conflict,
            Some("error") => ComplianceState::Error,
            Some("ingraceperiod") => ComplianceState::InGracePeriod,
            Some("configmanager") => ComplianceState::ConfigManager,
            _ => ComplianceState::Unknown,
        }
    }

    /// States for which the per-policy detail is worth fetching.
    pub fn needs_detail(&self) -> bool {
        matches!(
            self,
            ComplianceState::NonCompliant | ComplianceState::Conflict | ComplianceState::Error
        )
    }
}

// ============================================================================
// Device record
// ============================================================================

/// A managed device, uniquely keyed by `id`.
///
/// A device is compliant exactly when it carries no compliance issues; the
/// flag is always derived, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub serial_number: String,
    pub manufacturer: String,
    pub model: String,
    /// User principal name of the primary user.
    pub owner: Option<String>,
    pub owner_display_name: Option<String>,
    pub device_type: DeviceType,
    pub ownership: OwnershipType,
    pub operating_system: String,
    pub os_version: String,
    pub last_check_in: Option<DateTime<Utc>>,
    pub reported_state: ComplianceState,
    #[serde(default)]
    pub compliance_issues: Vec<String>,
    /// Canonical country of the owner; `None` until a location lookup
    /// succeeded for this device.
    #[serde(default)]
    pub country: Option<String>,
    /// Failures of secondary lookups that do not affect compliance.
    #[serde(default)]
    pub enrichment_errors: Vec<String>,
}

impl DeviceRecord {
    pub fn is_compliant(&self) -> bool {
        self.compliance_issues.is_empty()
    }

    pub fn has_location(&self) -> bool {
        self.country.is_some()
    }

    /// Whole days since the device last checked in, if it ever did.
    pub fn days_since_check_in(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_check_in.map(|t| (now - t).num_days().max(0))
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Fraction of devices whose location has been resolved. An empty set
/// counts as fully covered.
pub fn location_coverage(devices: &[DeviceRecord]) -> f64 {
    if devices.is_empty() {
        return 1.0;
    }
    let located = devices.iter().filter(|d| d.has_location()).count();
    located as f64 / devices.len() as f64
}

#[cfg(test)]
pub(crate) fn sample_device(id: &str, state: ComplianceState) -> DeviceRecord {
    DeviceRecord {
        id: id.to_string(),
        name: format!("DEVICE-{}", id.to_uppercase()),
        serial_number: format!("SN{}", id),
        manufacturer: "Dell Inc.".to_string(),
        model: "Latitude 7440".to_string(),
        owner: Some(format!("user{}@contoso.com", id)),
        owner_display_name: Some(format!("User {}", id)),
        device_type: DeviceType::Laptop,
        ownership: OwnershipType::Company,
        operating_system: "Windows".to_string(),
        os_version: "10.0.22631.3447".to_string(),
        last_check_in: None,
        reported_state: state,
        compliance_issues: if state.needs_detail() {
            vec![PENDING_DETAIL_ISSUE.to_string()]
        } else {
            Vec::new()
        },
        country: None,
        enrichment_errors: Vec::new(),
    }
}
