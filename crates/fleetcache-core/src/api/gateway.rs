//! Port to the remote device-management service.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use super::GatewayError;
use crate::models::{ConfigProfile, DeviceRecord};

/// Default budget for the whole device listing (all pages).
pub const DEFAULT_LIST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default budget for any single per-device lookup.
pub const DEFAULT_DETAIL_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a device listing. When the budget elapsed mid-listing,
/// `devices` holds the pages fetched before the deadline.
#[derive(Debug, Clone, Default)]
pub struct DeviceListing {
    pub devices: Vec<DeviceRecord>,
    pub timed_out: bool,
}

/// A remote action on one device. Reboot and wipe cannot be undone and
/// must be confirmed by the caller before they reach the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemediationAction {
    Sync,
    Reboot,
    Wipe {
        keep_enrollment_data: bool,
        keep_user_data: bool,
    },
    Notify {
        title: String,
        body: String,
    },
}

impl RemediationAction {
    pub fn requires_confirmation(&self) -> bool {
        matches!(self, RemediationAction::Reboot | RemediationAction::Wipe { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            RemediationAction::Sync => "sync",
            RemediationAction::Reboot => "reboot",
            RemediationAction::Wipe { .. } => "wipe",
            RemediationAction::Notify { .. } => "notify",
        }
    }

    /// Question put to the user before a high-risk action.
    pub fn confirmation_prompt(&self, device_name: &str) -> String {
        match self {
            RemediationAction::Reboot => format!(
                "Reboot {} now? Unsaved work on the device will be lost.",
                device_name
            ),
            RemediationAction::Wipe { keep_user_data, .. } if *keep_user_data => format!(
                "Reset {} to factory settings, keeping user data? This cannot be undone.",
                device_name
            ),
            RemediationAction::Wipe { .. } => format!(
                "Wipe ALL data from {}? This cannot be undone.",
                device_name
            ),
            other => format!("Send {} to {}?", other.name(), device_name),
        }
    }
}

impl fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Remote calls the sync engine depends on. Implementations bound every
/// call by the budget they were configured with; callers may impose a
/// tighter deadline with `tokio::time::timeout`, and dropping the future
/// cancels the call.
#[async_trait]
pub trait DeviceGateway: Send + Sync {
    /// List every managed device, stopping at `budget`.
    async fn list_devices(&self, budget: Duration) -> Result<DeviceListing, GatewayError>;

    /// Names of the compliance policies the device currently fails.
    async fn compliance_issues(&self, device_id: &str) -> Result<Vec<String>, GatewayError>;

    async fn configuration_profiles(
        &self,
        device_id: &str,
    ) -> Result<Vec<ConfigProfile>, GatewayError>;

    /// Raw country of a directory user, `None` if unset or the user is gone.
    async fn owner_country(&self, owner: &str) -> Result<Option<String>, GatewayError>;

    async fn remediate(
        &self,
        device_id: &str,
        action: &RemediationAction,
    ) -> Result<(), GatewayError>;
}
