use serde::{Deserialize, Serialize};

/// Deployment state of one configuration profile on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct ConfigProfile {
    pub id: String,
    pub display_name: String,
    pub state: String,
    pub version: Option<i64>,
}

impl ConfigProfile {
    /// Profiles in an error or conflict state need attention.
    pub fn is_failing(&self) -> bool {
        let state = self.state.to_lowercase();
        state == "error" || state == "conflict" || state == "noncompliant"
    }
}
