//! Microsoft Graph client for the device-management endpoints.
//!
//! This module provides the `GraphClient` struct, the production
//! `DeviceGateway`: paged device listing, per-device compliance and
//! configuration detail, owner lookups and remediation actions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use reqwest::{Client, Method, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::models::{
    classify_device_type, ComplianceState, ConfigProfile, DeviceRecord, OwnershipType,
    PENDING_DETAIL_ISSUE,
};

use super::{DeviceGateway, DeviceListing, GatewayError, RemediationAction, DEFAULT_DETAIL_TIMEOUT};

// ============================================================================
// Constants
// ============================================================================

/// Graph endpoint carrying the Intune device-management resources.
pub const DEFAULT_GRAPH_URL: &str = "https://graph.microsoft.com/beta";

/// HTTP request timeout in seconds, a backstop under the per-call budgets.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Page size requested from the device listing.
const DEVICE_PAGE_SIZE: u32 = 100;

const DEVICE_FIELDS: &str = "id,deviceName,serialNumber,manufacturer,model,userPrincipalName,\
userDisplayName,operatingSystem,osVersion,lastSyncDateTime,managedDeviceOwnerType,complianceState";

/// Per-policy states that make a device fail that policy.
const FAILING_POLICY_STATES: &[&str] = &["noncompliant", "error", "conflict"];

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManagedDevicePayload {
    id: String,
    device_name: Option<String>,
    serial_number: Option<String>,
    manufacturer: Option<String>,
    model: Option<String>,
    user_principal_name: Option<String>,
    user_display_name: Option<String>,
    operating_system: Option<String>,
    os_version: Option<String>,
    last_sync_date_time: Option<DateTime<Utc>>,
    managed_device_owner_type: Option<String>,
    compliance_state: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl ManagedDevicePayload {
    fn into_record(self) -> DeviceRecord {
        let operating_system = self.operating_system.unwrap_or_default();
        let model = self.model.unwrap_or_default();
        let reported_state = ComplianceState::from_remote(self.compliance_state.as_deref());
        let compliance_issues = if reported_state.needs_detail() {
            vec![PENDING_DETAIL_ISSUE.to_string()]
        } else {
            Vec::new()
        };

        DeviceRecord {
            id: self.id,
            name: self.device_name.unwrap_or_default(),
            serial_number: self.serial_number.unwrap_or_default(),
            manufacturer: self.manufacturer.unwrap_or_default(),
            device_type: classify_device_type(&operating_system, &model),
            model,
            owner: non_empty(self.user_principal_name),
            owner_display_name: non_empty(self.user_display_name),
            ownership: OwnershipType::from_remote(self.managed_device_owner_type.as_deref()),
            operating_system,
            os_version: self.os_version.unwrap_or_default(),
            // Graph reports devices that never synced as 0001-01-01
            last_check_in: self.last_sync_date_time.filter(|t| t.year() > 1),
            reported_state,
            compliance_issues,
            country: None,
            enrichment_errors: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyStatePayload {
    display_name: Option<String>,
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigurationStatePayload {
    id: String,
    display_name: Option<String>,
    state: Option<String>,
    version: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserPayload {
    country: Option<String>,
    usage_location: Option<String>,
}

// ============================================================================
// Client
// ============================================================================

/// Graph API client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct GraphClient {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
    detail_timeout: Duration,
}

impl GraphClient {
    pub fn new(base_url: &str, tokens: Arc<dyn TokenProvider>) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            detail_timeout: DEFAULT_DETAIL_TIMEOUT,
        })
    }

    /// Budget for each per-device call.
    pub fn with_detail_timeout(mut self, timeout: Duration) -> Self {
        self.detail_timeout = timeout;
        self
    }

    /// Base URL plus `segments`, each percent-encoded as one path segment.
    fn resource_url(&self, segments: &[&str]) -> Result<Url, GatewayError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| GatewayError::InvalidResponse(format!("bad base URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| GatewayError::InvalidResponse("base URL cannot hold a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn device_url(&self, device_id: &str, suffix: &str) -> Result<Url, GatewayError> {
        self.resource_url(&["deviceManagement", "managedDevices", device_id, suffix])
    }

    fn user_url(&self, owner: &str) -> Result<Url, GatewayError> {
        let mut url = self.resource_url(&["users", owner])?;
        url.query_pairs_mut()
            .append_pair("$select", "country,usageLocation");
        Ok(url)
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        tokio::time::timeout(self.detail_timeout, call)
            .await
            .unwrap_or_else(|_| Err(GatewayError::Timeout(self.detail_timeout.as_secs())))
    }

    /// Send an authenticated request. Retries 429 with exponential backoff
    /// and re-acquires the token once after a 401.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        let mut reauthenticated = false;

        loop {
            let token = self.tokens.access_token().await?;
            let mut request = self.client.request(method.clone(), url).bearer_auth(token);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            let status = response.status();

            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(GatewayError::RateLimited);
                }
                warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED {
                self.tokens.invalidate().await;
                if !reauthenticated {
                    debug!(url = url, "Token rejected, retrying with a fresh one");
                    reauthenticated = true;
                    continue;
                }
            }

            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, &body));
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, GatewayError> {
        self.send(Method::GET, url, None)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(format!("failed to parse {}: {}", url, e)))
    }

    async fn post(&self, url: &str, body: Option<&Value>) -> Result<(), GatewayError> {
        self.send(Method::POST, url, body).await.map(|_| ())
    }
}

#[async_trait]
impl DeviceGateway for GraphClient {
    async fn list_devices(&self, budget: Duration) -> Result<DeviceListing, GatewayError> {
        let deadline = Instant::now() + budget;
        let mut next = Some(format!(
            "{}/deviceManagement/managedDevices?$select={}&$top={}",
            self.base_url, DEVICE_FIELDS, DEVICE_PAGE_SIZE
        ));
        let mut devices = Vec::new();

        while let Some(url) = next.take() {
            match tokio::time::timeout_at(deadline, self.get::<Page<ManagedDevicePayload>>(&url)).await {
                Ok(page) => {
                    let page = page?;
                    debug!(count = page.value.len(), "Fetched device page");
                    devices.extend(page.value.into_iter().map(ManagedDevicePayload::into_record));
                    next = page.next_link;
                }
                Err(_) => {
                    warn!(
                        fetched = devices.len(),
                        budget_secs = budget.as_secs(),
                        "Device listing timed out, returning partial results"
                    );
                    return Ok(DeviceListing {
                        devices,
                        timed_out: true,
                    });
                }
            }
        }

        info!(count = devices.len(), "Listed managed devices");
        Ok(DeviceListing {
            devices,
            timed_out: false,
        })
    }

    async fn compliance_issues(&self, device_id: &str) -> Result<Vec<String>, GatewayError> {
        let url = self.device_url(device_id, "deviceCompliancePolicyStates")?;
        let page: Page<PolicyStatePayload> = self.bounded(self.get(url.as_str())).await?;

        let mut issues: Vec<String> = Vec::new();
        for policy in page.value {
            let failing = policy
                .state
                .as_deref()
                .map(|s| FAILING_POLICY_STATES.contains(&s.to_lowercase().as_str()))
                .unwrap_or(false);
            if !failing {
                continue;
            }
            let name = non_empty(policy.display_name).unwrap_or_else(|| "Unnamed policy".to_string());
            if !issues.contains(&name) {
                issues.push(name);
            }
        }
        Ok(issues)
    }

    async fn configuration_profiles(
        &self,
        device_id: &str,
    ) -> Result<Vec<ConfigProfile>, GatewayError> {
        let url = self.device_url(device_id, "deviceConfigurationStates")?;
        let page: Page<ConfigurationStatePayload> = self.bounded(self.get(url.as_str())).await?;

        Ok(page
            .value
            .into_iter()
            .map(|state| ConfigProfile {
                display_name: state.display_name.unwrap_or_else(|| state.id.clone()),
                id: state.id,
                state: state.state.unwrap_or_else(|| "unknown".to_string()),
                version: state.version,
            })
            .collect())
    }

    async fn owner_country(&self, owner: &str) -> Result<Option<String>, GatewayError> {
        let url = self.user_url(owner)?;
        match self.bounded(self.get::<UserPayload>(url.as_str())).await {
            Ok(user) => Ok(non_empty(user.country).or_else(|| non_empty(user.usage_location))),
            Err(e) if e.is_not_found() => {
                debug!(owner = owner, "Owner not found in directory");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn remediate(
        &self,
        device_id: &str,
        action: &RemediationAction,
    ) -> Result<(), GatewayError> {
        let (suffix, body) = match action {
            RemediationAction::Sync => ("syncDevice", None),
            RemediationAction::Reboot => ("rebootNow", None),
            RemediationAction::Wipe {
                keep_enrollment_data,
                keep_user_data,
            } => (
                "wipe",
                Some(json!({
                    "keepEnrollmentData": keep_enrollment_data,
                    "keepUserData": keep_user_data,
                })),
            ),
            RemediationAction::Notify { title, body } => (
                "sendCustomNotificationToCompanyPortal",
                Some(json!({
                    "notificationTitle": title,
                    "notificationBody": body,
                })),
            ),
        };

        let url = self.device_url(device_id, suffix)?;
        self.bounded(self.post(url.as_str(), body.as_ref())).await?;
        info!(device_id = device_id, action = action.name(), "Remediation action sent");
        Ok(())
    }
}
