//! Hand-written fakes for the token, gateway and confirmer seams.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::api::{DeviceGateway, DeviceListing, GatewayError, RemediationAction};
use crate::auth::{AuthError, TokenProvider};
use crate::models::device::sample_device;
use crate::models::{ComplianceState, ConfigProfile, DeviceRecord};
use crate::sync::Confirmer;

// ============================================================================
// Tokens
// ============================================================================

pub(crate) struct StaticTokens {
    outcome: Result<String, AuthError>,
    requests: AtomicUsize,
    invalidations: AtomicUsize,
}

impl StaticTokens {
    pub(crate) fn new(token: &str) -> Self {
        Self {
            outcome: Ok(token.to_string()),
            requests: AtomicUsize::new(0),
            invalidations: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing(err: AuthError) -> Self {
        Self {
            outcome: Err(err),
            requests: AtomicUsize::new(0),
            invalidations: AtomicUsize::new(0),
        }
    }

    pub(crate) fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub(crate) fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for StaticTokens {
    async fn access_token(&self) -> Result<String, AuthError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }

    async fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// `total` devices with ids "1".."total"; the first `non_compliant` of them
/// are reported non-compliant and carry the pending-detail issue.
pub(crate) fn fleet(total: usize, non_compliant: usize) -> Vec<DeviceRecord> {
    (1..=total)
        .map(|i| {
            let state = if i <= non_compliant {
                ComplianceState::NonCompliant
            } else {
                ComplianceState::Compliant
            };
            sample_device(&i.to_string(), state)
        })
        .collect()
}

#[derive(Default)]
pub(crate) struct FakeGateway {
    devices: Vec<DeviceRecord>,
    list_timeout_after: Option<usize>,
    list_failure: Option<String>,
    issues: HashMap<String, Vec<String>>,
    failing_devices: HashSet<String>,
    slow_devices: HashSet<String>,
    countries: HashMap<String, String>,
    failing_owners: HashSet<String>,
    profiles: Vec<ConfigProfile>,
    lookup_delay: Duration,

    list_calls: AtomicUsize,
    compliance_calls: AtomicUsize,
    country_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    remediations: Mutex<Vec<(String, String)>>,
}

impl FakeGateway {
    pub(crate) fn with_devices(mut self, devices: Vec<DeviceRecord>) -> Self {
        self.devices = devices;
        self
    }

    /// Listing yields only the first `n` devices and reports a timeout.
    pub(crate) fn timing_out_after(mut self, n: usize) -> Self {
        self.list_timeout_after = Some(n);
        self
    }

    pub(crate) fn failing_list(mut self, message: &str) -> Self {
        self.list_failure = Some(message.to_string());
        self
    }

    pub(crate) fn with_issues(mut self, device_id: &str, issues: &[&str]) -> Self {
        self.issues.insert(
            device_id.to_string(),
            issues.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    pub(crate) fn failing_device(mut self, device_id: &str) -> Self {
        self.failing_devices.insert(device_id.to_string());
        self
    }

    /// Compliance lookups for this device never finish.
    pub(crate) fn slow_device(mut self, device_id: &str) -> Self {
        self.slow_devices.insert(device_id.to_string());
        self
    }

    pub(crate) fn with_country(mut self, owner: &str, country: &str) -> Self {
        self.countries.insert(owner.to_string(), country.to_string());
        self
    }

    /// Assign the same country to every owner of the configured devices.
    pub(crate) fn with_fleet_country(mut self, country: &str) -> Self {
        for owner in self.devices.iter().filter_map(|d| d.owner.clone()) {
            self.countries.insert(owner, country.to_string());
        }
        self
    }

    pub(crate) fn failing_owner(mut self, owner: &str) -> Self {
        self.failing_owners.insert(owner.to_string());
        self
    }

    pub(crate) fn with_profiles(mut self, profiles: Vec<ConfigProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    pub(crate) fn with_lookup_delay(mut self, delay: Duration) -> Self {
        self.lookup_delay = delay;
        self
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn compliance_calls(&self) -> usize {
        self.compliance_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn country_calls(&self) -> usize {
        self.country_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn remediations(&self) -> Vec<(String, String)> {
        self.remediations.lock().unwrap().clone()
    }

    async fn track<T>(&self, result: T) -> T {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.lookup_delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl DeviceGateway for FakeGateway {
    async fn list_devices(&self, _budget: Duration) -> Result<DeviceListing, GatewayError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.list_failure {
            return Err(GatewayError::Server(message.clone()));
        }
        match self.list_timeout_after {
            Some(n) => Ok(DeviceListing {
                devices: self.devices.iter().take(n).cloned().collect(),
                timed_out: true,
            }),
            None => Ok(DeviceListing {
                devices: self.devices.clone(),
                timed_out: false,
            }),
        }
    }

    async fn compliance_issues(&self, device_id: &str) -> Result<Vec<String>, GatewayError> {
        self.compliance_calls.fetch_add(1, Ordering::SeqCst);
        if self.slow_devices.contains(device_id) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.failing_devices.contains(device_id) {
            return self
                .track(Err(GatewayError::Server("policy states unavailable".to_string())))
                .await;
        }
        let issues = self.issues.get(device_id).cloned().unwrap_or_default();
        self.track(Ok(issues)).await
    }

    async fn configuration_profiles(
        &self,
        _device_id: &str,
    ) -> Result<Vec<ConfigProfile>, GatewayError> {
        Ok(self.profiles.clone())
    }

    async fn owner_country(&self, owner: &str) -> Result<Option<String>, GatewayError> {
        self.country_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_owners.contains(owner) {
            return self
                .track(Err(GatewayError::Server("directory unavailable".to_string())))
                .await;
        }
        let country = self.countries.get(owner).cloned();
        self.track(Ok(country)).await
    }

    async fn remediate(
        &self,
        device_id: &str,
        action: &RemediationAction,
    ) -> Result<(), GatewayError> {
        self.remediations
            .lock()
            .unwrap()
            .push((device_id.to_string(), action.name().to_string()));
        Ok(())
    }
}

// ============================================================================
// Confirmer
// ============================================================================

pub(crate) struct FakeConfirmer {
    answer: bool,
    prompts: Mutex<Vec<String>>,
}

impl FakeConfirmer {
    pub(crate) fn answering(answer: bool) -> Self {
        Self {
            answer,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Confirmer for FakeConfirmer {
    async fn confirm(&self, prompt: &str) -> bool {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.answer
    }
}
