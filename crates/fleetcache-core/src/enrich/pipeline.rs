use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::api::{DeviceGateway, GatewayError, DEFAULT_DETAIL_TIMEOUT};
use crate::models::{
    DeviceRecord, FAILED_CHECK_PREFIX, PENDING_DETAIL_ISSUE, TIMED_OUT_ISSUE, UNKNOWN_COUNTRY,
};

use super::normalize_country;

/// Lookups allowed in flight at once, to stay under the remote rate limits.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Prefix of the entry left in `enrichment_errors` by a failed owner lookup.
pub const LOCATION_ERROR_PREFIX: &str = "Location lookup failed";

/// Counts from one enrichment pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentReport {
    pub compliance_checked: usize,
    pub compliance_failed: usize,
    pub owners_looked_up: usize,
    pub locations_failed: usize,
}

impl EnrichmentReport {
    pub fn failures(&self) -> usize {
        self.compliance_failed + self.locations_failed
    }

    pub fn is_clean(&self) -> bool {
        self.failures() == 0
    }
}

/// Augments device records with compliance detail and owner location.
///
/// Every lookup runs under a per-item budget on a pool of at most
/// `concurrency` concurrent calls. A failing item gets an error recorded on
/// it and the rest of the batch carries on; the pass itself never fails.
/// Running it again over enriched records recomputes the same fields.
pub struct EnrichmentPipeline {
    gateway: Arc<dyn DeviceGateway>,
    concurrency: usize,
    detail_timeout: Duration,
}

enum Lookup<T> {
    Done(T),
    TimedOut,
    Failed(GatewayError),
}

impl EnrichmentPipeline {
    pub fn new(gateway: Arc<dyn DeviceGateway>) -> Self {
        Self {
            gateway,
            concurrency: DEFAULT_CONCURRENCY,
            detail_timeout: DEFAULT_DETAIL_TIMEOUT,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_detail_timeout(mut self, timeout: Duration) -> Self {
        self.detail_timeout = timeout;
        self
    }

    /// Full pass: compliance detail for every device reported non-compliant,
    /// then the country of every owner.
    pub async fn enrich(&self, devices: &mut [DeviceRecord]) -> EnrichmentReport {
        let mut report = EnrichmentReport::default();
        self.enrich_compliance(devices, &mut report).await;
        self.enrich_locations(devices, false, &mut report).await;
        info!(
            devices = devices.len(),
            compliance_checked = report.compliance_checked,
            owners = report.owners_looked_up,
            failures = report.failures(),
            "Enrichment complete"
        );
        report
    }

    /// Location lookups only, for devices that have no country yet.
    pub async fn patch_locations(&self, devices: &mut [DeviceRecord]) -> EnrichmentReport {
        let mut report = EnrichmentReport::default();
        self.enrich_locations(devices, true, &mut report).await;
        info!(
            owners = report.owners_looked_up,
            failures = report.locations_failed,
            "Location patch complete"
        );
        report
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, GatewayError>>,
    ) -> Lookup<T> {
        match tokio::time::timeout(self.detail_timeout, call).await {
            Ok(Ok(value)) => Lookup::Done(value),
            Ok(Err(e)) if e.is_timeout() => Lookup::TimedOut,
            Ok(Err(e)) => Lookup::Failed(e),
            Err(_) => Lookup::TimedOut,
        }
    }

    async fn enrich_compliance(&self, devices: &mut [DeviceRecord], report: &mut EnrichmentReport) {
        let targets: Vec<(usize, String)> = devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.reported_state.needs_detail())
            .map(|(idx, d)| (idx, d.id.clone()))
            .collect();
        if targets.is_empty() {
            return;
        }
        debug!(count = targets.len(), "Fetching compliance detail");

        let results: Vec<(usize, Lookup<Vec<String>>)> = stream::iter(targets)
            .map(|(idx, id)| async move {
                let outcome = self.bounded(self.gateway.compliance_issues(&id)).await;
                (idx, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (idx, outcome) in results {
            let device = &mut devices[idx];
            report.compliance_checked += 1;
            device.compliance_issues = match outcome {
                Lookup::Done(issues) if issues.is_empty() => {
                    debug!(device_id = %device.id, "No failing policy reported yet");
                    vec![PENDING_DETAIL_ISSUE.to_string()]
                }
                Lookup::Done(issues) => issues,
                Lookup::TimedOut => {
                    warn!(device_id = %device.id, "Compliance check timed out");
                    report.compliance_failed += 1;
                    vec![TIMED_OUT_ISSUE.to_string()]
                }
                Lookup::Failed(e) => {
                    warn!(device_id = %device.id, error = %e, "Compliance check failed");
                    report.compliance_failed += 1;
                    vec![format!("{}: {}", FAILED_CHECK_PREFIX, e)]
                }
            };
        }
    }

    async fn enrich_locations(
        &self,
        devices: &mut [DeviceRecord],
        only_missing: bool,
        report: &mut EnrichmentReport,
    ) {
        let mut owners = BTreeSet::new();
        for device in devices.iter_mut() {
            if only_missing && device.has_location() {
                continue;
            }
            match &device.owner {
                Some(owner) => {
                    owners.insert(owner.clone());
                }
                None => device.country = Some(UNKNOWN_COUNTRY.to_string()),
            }
        }
        if owners.is_empty() {
            return;
        }
        debug!(count = owners.len(), "Looking up owner locations");
        report.owners_looked_up = owners.len();

        let results: HashMap<String, Lookup<Option<String>>> = stream::iter(owners)
            .map(|owner| async move {
                let outcome = self.bounded(self.gateway.owner_country(&owner)).await;
                (owner, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for outcome in results.values() {
            if !matches!(outcome, Lookup::Done(_)) {
                report.locations_failed += 1;
            }
        }

        for device in devices.iter_mut() {
            if only_missing && device.has_location() {
                continue;
            }
            let Some(outcome) = device.owner.as_ref().and_then(|o| results.get(o)) else {
                continue;
            };
            device
                .enrichment_errors
                .retain(|e| !e.starts_with(LOCATION_ERROR_PREFIX));
            match outcome {
                Lookup::Done(raw) => {
                    device.country = Some(normalize_country(raw.as_deref().unwrap_or_default()));
                }
                Lookup::TimedOut => device
                    .enrichment_errors
                    .push(format!("{}: timed out", LOCATION_ERROR_PREFIX)),
                Lookup::Failed(e) => device
                    .enrichment_errors
                    .push(format!("{}: {}", LOCATION_ERROR_PREFIX, e)),
            }
        }

        if report.locations_failed > 0 {
            warn!(failed = report.locations_failed, "Some owner locations could not be resolved");
        }
    }
}
