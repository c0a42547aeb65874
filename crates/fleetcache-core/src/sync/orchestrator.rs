//! Sync request state machine.
//!
//! `SyncOrchestrator::load_data` serves the device set from the tiered cache
//! when it can and otherwise runs sign-in, listing, enrichment and
//! persistence in that order. Failures keep whatever data is available:
//! a timed-out listing returns the devices received so far, and a failed
//! refresh falls back to the last cached device set regardless of age.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::RemediationAction;
use crate::cache::{CacheKey, CachedData};
use crate::enrich::EnrichmentPipeline;
use crate::models::{
    group_by_policy, location_coverage, AggregateStats, ComplianceByPolicy, ConfigProfile,
    DeviceRecord, LocationSnapshot,
};

use super::{ServiceContext, SyncError, SyncProgress, SyncState};

/// Where the devices of a `LoadOutcome` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    /// Valid cache entry.
    Cache,
    /// Fetched during this request.
    Remote,
    /// Expired cache entry, served because the refresh failed.
    Stale,
    /// Nothing to show.
    Empty,
}

/// Result of `load_data`. Always carries displayable data and a status
/// line; `error` is set when the request ended in `Failed`.
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub devices: Vec<DeviceRecord>,
    pub stats: AggregateStats,
    pub source: DataSource,
    pub state: SyncState,
    pub status: String,
    pub in_progress: bool,
    pub captured_at: Option<DateTime<Utc>>,
    /// The listing hit its deadline; `devices` is incomplete and was not cached.
    pub partial: bool,
    pub warnings: Vec<String>,
    pub error: Option<SyncError>,
}

/// One view for the presentation layer.
#[derive(Debug, Clone)]
pub struct ViewData<T> {
    pub data: T,
    pub status: String,
    /// A sync request is running in the background.
    pub in_progress: bool,
    pub captured_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationOutcome {
    Completed,
    Declined,
}

/// Decrements the running-request count even if the request is dropped.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SyncOrchestrator {
    ctx: ServiceContext,
    pipeline: EnrichmentPipeline,
    progress: watch::Sender<SyncProgress>,
    active: AtomicUsize,
}

impl SyncOrchestrator {
    pub fn new(ctx: ServiceContext) -> Self {
        let pipeline = EnrichmentPipeline::new(Arc::clone(&ctx.gateway))
            .with_concurrency(ctx.settings.enrichment_concurrency)
            .with_detail_timeout(ctx.settings.detail_timeout());
        let (progress, _) = watch::channel(SyncProgress::default());

        Self {
            ctx,
            pipeline,
            progress,
            active: AtomicUsize::new(0),
        }
    }

    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    /// Progress of the most recent transition, updated live.
    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    /// Publish a state, then yield so subscribers on this runtime see it
    /// before the next one replaces it.
    async fn transition(&self, state: SyncState, status: impl Into<String>) {
        let progress = SyncProgress::new(state, status);
        debug!(state = ?state, status = %progress.status, "Sync state");
        self.progress.send_replace(progress);
        tokio::task::yield_now().await;
    }

    // ===== Loading =====

    /// Load the device set, from cache unless `force_refresh` is set or
    /// the cached set has expired.
    pub async fn load_data(&self, force_refresh: bool) -> LoadOutcome {
        let outcome = {
            let _active = ActiveGuard::enter(&self.active);
            self.run_load(force_refresh).await
        };
        self.transition(outcome.state, outcome.status.clone()).await;
        outcome
    }

    async fn run_load(&self, force_refresh: bool) -> LoadOutcome {
        self.transition(SyncState::CheckCache, SyncState::CheckCache.label()).await;

        if force_refresh {
            info!("Forced refresh, bypassing cache");
        } else if let Some(cached) = self.ctx.cache.get::<Vec<DeviceRecord>>(CacheKey::Devices).await {
            return self.serve_cached(cached).await;
        } else {
            debug!("Device cache miss");
        }

        self.refresh().await
    }

    async fn serve_cached(&self, cached: CachedData<Vec<DeviceRecord>>) -> LoadOutcome {
        let age = cached.age_display();
        self.transition(SyncState::CacheHit, format!("Loaded from cache ({})", age)).await;

        let coverage = location_coverage(&cached.data);
        let threshold = self.ctx.settings.min_location_coverage;
        if coverage < threshold {
            info!(coverage, threshold, "Cached devices lack locations, refreshing locations only");
            return self.patch_locations(cached).await;
        }

        debug!(devices = cached.data.len(), age = %age, "Serving devices from cache");
        let status = format!("Loaded {} devices from cache ({})", cached.data.len(), age);
        Self::outcome(cached.data, DataSource::Cache, SyncState::CacheHit, status)
            .captured(cached.cached_at)
    }

    /// Enrichment-only pass over a cached set. The base records were not
    /// re-fetched, so the capture time is kept.
    async fn patch_locations(&self, cached: CachedData<Vec<DeviceRecord>>) -> LoadOutcome {
        let age = cached.age_display();
        let CachedData {
            data: mut devices,
            cached_at,
        } = cached;

        self.transition(SyncState::Authenticating, SyncState::Authenticating.label()).await;
        if let Err(e) = self.ctx.tokens.access_token().await {
            let err = SyncError::from(e);
            warn!(error = %err, "Skipping location refresh");
            let status = format!("Loaded {} devices from cache ({})", devices.len(), age);
            let mut outcome = Self::outcome(devices, DataSource::Cache, SyncState::CacheHit, status)
                .captured(cached_at);
            outcome.warnings.push(format!("Location refresh skipped: {}", err));
            outcome.error = Some(err);
            return outcome;
        }

        self.transition(SyncState::Enriching, "Resolving device locations...").await;
        let report = self.pipeline.patch_locations(&mut devices).await;

        let mut warnings = Vec::new();
        if report.locations_failed > 0 {
            warnings.push(
                SyncError::PartialEnrichmentFailure {
                    failed: report.locations_failed,
                }
                .to_string(),
            );
        }

        self.transition(SyncState::Persisting, SyncState::Persisting.label()).await;
        if let Err(e) = self.persist(&devices, cached_at).await {
            warn!(error = %e, "Failed to re-persist patched devices");
            warnings.push(e.to_string());
        }

        let status = format!(
            "Loaded {} devices from cache ({}), locations refreshed",
            devices.len(),
            age
        );
        let mut outcome = Self::outcome(devices, DataSource::Cache, SyncState::Done, status)
            .captured(cached_at);
        outcome.warnings = warnings;
        outcome
    }

    async fn refresh(&self) -> LoadOutcome {
        self.transition(SyncState::Authenticating, SyncState::Authenticating.label()).await;
        if let Err(e) = self.ctx.tokens.access_token().await {
            return self.fail(e.into()).await;
        }

        self.transition(SyncState::Fetching, SyncState::Fetching.label()).await;
        let budget = self.ctx.settings.list_timeout();
        let listing = match self.ctx.gateway.list_devices(budget).await {
            Ok(listing) => listing,
            Err(e) => return self.fail(e.into()).await,
        };

        let mut warnings = Vec::new();
        let mut devices = listing.devices;
        if listing.timed_out {
            if devices.is_empty() {
                return self
                    .fail(SyncError::RemoteTimeout(format!(
                        "no devices received within {}s",
                        budget.as_secs()
                    )))
                    .await;
            }
            warn!(received = devices.len(), "Device listing incomplete");
            warnings.push(format!(
                "Device list timed out after {}s; showing {} devices received so far",
                budget.as_secs(),
                devices.len()
            ));
        }

        self.transition(
            SyncState::Enriching,
            format!("Checking {} devices...", devices.len()),
        ).await;
        let report = self.pipeline.enrich(&mut devices).await;
        if !report.is_clean() {
            warnings.push(
                SyncError::PartialEnrichmentFailure {
                    failed: report.failures(),
                }
                .to_string(),
            );
        }

        let captured_at = Utc::now();
        if listing.timed_out {
            debug!("Partial device list not cached");
        } else {
            self.transition(SyncState::Persisting, SyncState::Persisting.label()).await;
            if let Err(e) = self.persist(&devices, captured_at).await {
                warn!(error = %e, "Failed to persist devices");
                warnings.push(e.to_string());
            }
        }

        let status = format!("Synced {} devices", devices.len());
        info!(devices = devices.len(), warnings = warnings.len(), "Sync complete");
        let mut outcome = Self::outcome(devices, DataSource::Remote, SyncState::Done, status)
            .captured(captured_at);
        outcome.partial = listing.timed_out;
        outcome.warnings = warnings;
        outcome
    }

    /// End the request in `Failed`, keeping the last cached devices on screen.
    async fn fail(&self, err: SyncError) -> LoadOutcome {
        warn!(error = %err, "Sync failed");

        let mut outcome = match self
            .ctx
            .cache
            .get_stale::<Vec<DeviceRecord>>(CacheKey::Devices)
            .await
        {
            Some(stale) => {
                let status = format!("{} - showing cached data from {}", err, stale.age_display());
                Self::outcome(stale.data, DataSource::Stale, SyncState::Failed, status)
                    .captured(stale.cached_at)
            }
            None => Self::outcome(Vec::new(), DataSource::Empty, SyncState::Failed, err.to_string()),
        };
        outcome.error = Some(err);
        outcome
    }

    /// Write the device set and every dataset derived from it. The cached
    /// datasets always describe one device set: if the device list cannot
    /// be written nothing else is, and a derived dataset that fails to
    /// write is dropped so views recompute it from the devices.
    async fn persist(&self, devices: &[DeviceRecord], captured_at: DateTime<Utc>) -> Result<(), SyncError> {
        let cache = &self.ctx.cache;
        cache
            .put_captured_at(CacheKey::Devices, &devices, captured_at)
            .await?;

        let stats = AggregateStats::from_devices(devices);
        let by_policy = group_by_policy(devices);
        let locations = LocationSnapshot::from_devices(devices);
        let results = [
            (
                CacheKey::Stats,
                cache.put_captured_at(CacheKey::Stats, &stats, captured_at).await,
            ),
            (
                CacheKey::ComplianceByPolicy,
                cache
                    .put_captured_at(CacheKey::ComplianceByPolicy, &by_policy, captured_at)
                    .await,
            ),
            (
                CacheKey::DeviceLocations,
                cache
                    .put_captured_at(CacheKey::DeviceLocations, &locations, captured_at)
                    .await,
            ),
        ];

        let mut first_error = None;
        for (key, result) in results {
            if let Err(e) = result {
                warn!(cache = key.name(), error = %e, "Dropping derived dataset that failed to write");
                if let Err(clear_err) = cache.clear(key).await {
                    warn!(cache = key.name(), error = %clear_err, "Failed to drop derived dataset");
                }
                first_error.get_or_insert(SyncError::from(e));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!(devices = devices.len(), "Cache updated");
                Ok(())
            }
        }
    }

    fn outcome(
        devices: Vec<DeviceRecord>,
        source: DataSource,
        state: SyncState,
        status: String,
    ) -> LoadOutcome {
        LoadOutcome {
            stats: AggregateStats::from_devices(&devices),
            devices,
            source,
            state,
            status,
            in_progress: false,
            captured_at: None,
            partial: false,
            warnings: Vec::new(),
            error: None,
        }
    }

    // ===== Views =====

    pub async fn get_quick_stats(&self) -> ViewData<AggregateStats> {
        if let Some(cached) = self.ctx.cache.get::<AggregateStats>(CacheKey::Stats).await {
            return self.cached_view(cached);
        }
        let outcome = self.load_data(false).await;
        self.outcome_view(&outcome, |o| o.stats.clone())
    }

    pub async fn get_devices_grouped_by_policy(&self) -> ViewData<ComplianceByPolicy> {
        if let Some(cached) = self
            .ctx
            .cache
            .get::<ComplianceByPolicy>(CacheKey::ComplianceByPolicy)
            .await
        {
            return self.cached_view(cached);
        }
        let outcome = self.load_data(false).await;
        self.outcome_view(&outcome, |o| group_by_policy(&o.devices))
    }

    pub async fn get_device_locations(&self) -> ViewData<LocationSnapshot> {
        if let Some(cached) = self
            .ctx
            .cache
            .get::<LocationSnapshot>(CacheKey::DeviceLocations)
            .await
        {
            return self.cached_view(cached);
        }
        let outcome = self.load_data(false).await;
        self.outcome_view(&outcome, |o| LocationSnapshot::from_devices(&o.devices))
    }

    fn cached_view<T>(&self, cached: CachedData<T>) -> ViewData<T> {
        ViewData {
            status: format!("Updated {}", cached.age_display()),
            captured_at: Some(cached.cached_at),
            data: cached.data,
            in_progress: self.is_syncing(),
        }
    }

    fn outcome_view<T>(&self, outcome: &LoadOutcome, f: impl FnOnce(&LoadOutcome) -> T) -> ViewData<T> {
        ViewData {
            data: f(outcome),
            status: outcome.status.clone(),
            in_progress: self.is_syncing(),
            captured_at: outcome.captured_at,
        }
    }

    // ===== Maintenance and actions =====

    /// Drop every dataset from both cache tiers. The next `load_data`
    /// behaves as a cold start.
    pub async fn clear_cache(&self) -> Result<(), SyncError> {
        self.ctx.cache.clear_all().await?;
        info!("Cache cleared");
        self.transition(SyncState::Idle, "Cache cleared").await;
        Ok(())
    }

    pub async fn configuration_profiles(&self, device_id: &str) -> Result<Vec<ConfigProfile>, SyncError> {
        Ok(self.ctx.gateway.configuration_profiles(device_id).await?)
    }

    /// Run a remediation action. Reboot and wipe go ahead only after the
    /// confirmer approves.
    pub async fn remediate(
        &self,
        device_id: &str,
        action: RemediationAction,
    ) -> Result<RemediationOutcome, SyncError> {
        if action.requires_confirmation() {
            let name = self.device_name(device_id).await;
            let prompt = action.confirmation_prompt(&name);
            if !self.ctx.confirmer.confirm(&prompt).await {
                info!(device_id = device_id, action = action.name(), "Remediation declined");
                return Ok(RemediationOutcome::Declined);
            }
        }

        self.ctx.gateway.remediate(device_id, &action).await?;
        Ok(RemediationOutcome::Completed)
    }

    pub async fn sign_out(&self) -> Result<(), SyncError> {
        self.ctx.tokens.sign_out().await?;
        Ok(())
    }

    async fn device_name(&self, device_id: &str) -> String {
        self.ctx
            .cache
            .get_stale::<Vec<DeviceRecord>>(CacheKey::Devices)
            .await
            .and_then(|cached| {
                cached
                    .data
                    .into_iter()
                    .find(|d| d.id == device_id)
                    .map(|d| d.display_name().to_string())
            })
            .unwrap_or_else(|| device_id.to_string())
    }
}

impl LoadOutcome {
    fn captured(mut self, at: DateTime<Utc>) -> Self {
        self.captured_at = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthError;
    use crate::cache::TieredCache;
    use crate::config::SyncSettings;
    use crate::models::{FAILED_CHECK_PREFIX, UNKNOWN_COUNTRY};
    use crate::testing::{fleet, FakeConfirmer, FakeGateway, StaticTokens};
    use chrono::Duration;
    use tempfile::TempDir;

    struct Harness {
        orchestrator: SyncOrchestrator,
        gateway: Arc<FakeGateway>,
        tokens: Arc<StaticTokens>,
        confirmer: Arc<FakeConfirmer>,
        cache: Arc<TieredCache>,
        _dir: TempDir,
    }

    fn harness(gateway: FakeGateway) -> Harness {
        harness_with(gateway, StaticTokens::new("token"), false)
    }

    fn harness_with(gateway: FakeGateway, tokens: StaticTokens, confirm: bool) -> Harness {
        let dir = TempDir::new().expect("temp dir");
        let cache = Arc::new(TieredCache::new(dir.path().to_path_buf()).expect("cache"));
        let gateway = Arc::new(gateway);
        let tokens = Arc::new(tokens);
        let confirmer = Arc::new(FakeConfirmer::answering(confirm));
        let ctx = ServiceContext::new(
            SyncSettings::default(),
            tokens.clone(),
            gateway.clone(),
            cache.clone(),
            confirmer.clone(),
        );

        Harness {
            orchestrator: SyncOrchestrator::new(ctx),
            gateway,
            tokens,
            confirmer,
            cache,
            _dir: dir,
        }
    }

    fn located_fleet(total: usize, non_compliant: usize) -> Vec<DeviceRecord> {
        let mut devices = fleet(total, non_compliant);
        for device in &mut devices {
            device.country = Some("Canada".to_string());
        }
        devices
    }

    async fn seed(cache: &TieredCache, devices: &[DeviceRecord], age: Duration) -> DateTime<Utc> {
        let captured_at = Utc::now() - age;
        cache
            .put_captured_at(CacheKey::Devices, &devices, captured_at)
            .await
            .expect("seed");
        captured_at
    }

    fn five_with_two_failing() -> FakeGateway {
        let devices = fleet(5, 2);
        FakeGateway::default()
            .with_devices(devices)
            .with_issues("1", &["BitLocker Required"])
            .with_issues("2", &["Minimum OS Version"])
            .with_fleet_country("Canada")
    }

    #[tokio::test]
    async fn test_cold_start_fetches_enriches_and_caches() {
        let h = harness(five_with_two_failing());

        let outcome = h.orchestrator.load_data(false).await;

        assert_eq!(outcome.source, DataSource::Remote);
        assert_eq!(outcome.state, SyncState::Done);
        assert_eq!(outcome.stats.total_devices, 5);
        assert_eq!(outcome.stats.non_compliant_devices, 2);
        assert!(outcome.error.is_none());
        assert!(outcome.warnings.is_empty());
        assert!(!outcome.in_progress);
        assert_eq!(h.gateway.list_calls(), 1);
        assert_eq!(h.tokens.requests(), 1);

        let cached = h.cache.get::<Vec<DeviceRecord>>(CacheKey::Devices).await.expect("devices cached");
        assert_eq!(cached.data, outcome.devices);
        assert!(h.cache.get::<AggregateStats>(CacheKey::Stats).await.is_some());
        assert!(h.cache.get::<ComplianceByPolicy>(CacheKey::ComplianceByPolicy).await.is_some());
        assert!(h.cache.get::<LocationSnapshot>(CacheKey::DeviceLocations).await.is_some());

        let again = h.orchestrator.load_data(false).await;
        assert_eq!(again.source, DataSource::Cache);
        assert_eq!(h.gateway.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_warm_cache_skips_remote() {
        let h = harness(FakeGateway::default());
        seed(&h.cache, &located_fleet(5, 0), Duration::hours(1)).await;

        let outcome = h.orchestrator.load_data(false).await;

        assert_eq!(outcome.source, DataSource::Cache);
        assert_eq!(outcome.state, SyncState::CacheHit);
        assert_eq!(outcome.devices.len(), 5);
        assert_eq!(h.gateway.list_calls(), 0);
        assert_eq!(h.gateway.country_calls(), 0);
        assert_eq!(h.tokens.requests(), 0);
    }

    #[tokio::test]
    async fn test_expired_cache_triggers_fetch() {
        let h = harness(five_with_two_failing());
        seed(&h.cache, &located_fleet(3, 0), Duration::hours(25)).await;

        let outcome = h.orchestrator.load_data(false).await;

        assert_eq!(outcome.source, DataSource::Remote);
        assert_eq!(outcome.devices.len(), 5);
        assert_eq!(h.gateway.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_valid_cache() {
        let h = harness(five_with_two_failing());
        seed(&h.cache, &located_fleet(3, 0), Duration::hours(1)).await;

        let outcome = h.orchestrator.load_data(true).await;

        assert_eq!(outcome.source, DataSource::Remote);
        assert_eq!(outcome.devices.len(), 5);
        assert_eq!(h.gateway.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_list_timeout_returns_partial_devices() {
        let h = harness(five_with_two_failing().timing_out_after(3));

        let outcome = h.orchestrator.load_data(false).await;

        assert_eq!(outcome.devices.len(), 3);
        assert!(outcome.partial);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("timed out"));
        assert!(h.cache.get::<Vec<DeviceRecord>>(CacheKey::Devices).await.is_none());
    }

    #[tokio::test]
    async fn test_low_location_coverage_patches_without_refetch() {
        let devices = fleet(4, 0);
        let gateway = FakeGateway::default()
            .with_devices(devices.clone())
            .with_fleet_country("Deutschland");
        let h = harness(gateway);
        let seeded_at = seed(&h.cache, &devices, Duration::hours(2)).await;

        let outcome = h.orchestrator.load_data(false).await;

        assert_eq!(h.gateway.list_calls(), 0);
        assert_eq!(h.gateway.compliance_calls(), 0);
        assert_eq!(h.gateway.country_calls(), 4);
        assert_eq!(outcome.source, DataSource::Cache);
        assert!(outcome.devices.iter().all(|d| d.country.as_deref() == Some("Germany")));
        assert_eq!(outcome.captured_at, Some(seeded_at));

        let cached = h.cache.get::<Vec<DeviceRecord>>(CacheKey::Devices).await.expect("cached");
        assert_eq!(cached.cached_at, seeded_at);
        assert_eq!(location_coverage(&cached.data), 1.0);
    }

    #[tokio::test]
    async fn test_coverage_at_threshold_is_served_as_is() {
        let mut devices = located_fleet(4, 0);
        devices[0].country = None;
        devices[1].country = None;
        let h = harness(FakeGateway::default());
        seed(&h.cache, &devices, Duration::hours(1)).await;

        let outcome = h.orchestrator.load_data(false).await;

        assert_eq!(outcome.state, SyncState::CacheHit);
        assert_eq!(h.gateway.country_calls(), 0);
    }

    #[tokio::test]
    async fn test_auth_failure_keeps_stale_cache_on_screen() {
        let h = harness_with(
            five_with_two_failing(),
            StaticTokens::failing(AuthError::InteractionRequired("consent revoked".to_string())),
            false,
        );
        seed(&h.cache, &located_fleet(5, 1), Duration::hours(30)).await;

        let outcome = h.orchestrator.load_data(false).await;

        assert_eq!(outcome.state, SyncState::Failed);
        assert_eq!(outcome.source, DataSource::Stale);
        assert!(matches!(outcome.error, Some(SyncError::AuthRequired(_))));
        assert_eq!(outcome.devices.len(), 5);
        assert!(outcome.status.contains("showing cached data"));
        assert_eq!(h.gateway.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_failure_without_cache_is_empty() {
        let h = harness(FakeGateway::default().failing_list("503 Service Unavailable"));

        let outcome = h.orchestrator.load_data(false).await;

        assert_eq!(outcome.state, SyncState::Failed);
        assert_eq!(outcome.source, DataSource::Empty);
        assert!(outcome.devices.is_empty());
        assert!(matches!(outcome.error, Some(SyncError::RemoteUnavailable(_))));
    }

    #[tokio::test]
    async fn test_enrichment_failure_is_recorded_and_sync_completes() {
        let h = harness(five_with_two_failing().failing_device("1"));

        let outcome = h.orchestrator.load_data(false).await;

        assert_eq!(outcome.state, SyncState::Done);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.warnings.len(), 1);
        let failed = outcome.devices.iter().find(|d| d.id == "1").expect("device 1");
        assert!(failed.compliance_issues[0].starts_with(FAILED_CHECK_PREFIX));
        assert_eq!(outcome.stats.non_compliant_devices, 2);
        assert!(h.cache.get::<Vec<DeviceRecord>>(CacheKey::Devices).await.is_some());
    }

    #[tokio::test]
    async fn test_clear_cache_forces_cold_start() {
        let h = harness(five_with_two_failing());
        h.orchestrator.load_data(false).await;

        h.orchestrator.clear_cache().await.expect("clear");

        for key in CacheKey::ALL {
            assert!(h.cache.get::<serde_json::Value>(key).await.is_none());
        }
        h.orchestrator.load_data(false).await;
        assert_eq!(h.gateway.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_views_load_on_demand_then_use_cache() {
        let h = harness(five_with_two_failing());

        let by_policy = h.orchestrator.get_devices_grouped_by_policy().await;
        assert_eq!(by_policy.data.len(), 2);
        assert_eq!(by_policy.data["BitLocker Required"][0].device_id, "1");
        assert!(!by_policy.in_progress);

        let stats = h.orchestrator.get_quick_stats().await;
        assert_eq!(stats.data.total_devices, 5);
        assert!(stats.captured_at.is_some());

        let locations = h.orchestrator.get_device_locations().await;
        assert_eq!(locations.data.by_country.get("Canada"), Some(&5));
        assert_eq!(locations.data.unresolved, 0);
        assert!(!locations.data.by_country.contains_key(UNKNOWN_COUNTRY));

        assert_eq!(h.gateway.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_destructive_remediation_needs_confirmation() {
        let h = harness(FakeGateway::default());
        seed(&h.cache, &located_fleet(2, 0), Duration::hours(1)).await;

        let wipe = RemediationAction::Wipe {
            keep_enrollment_data: false,
            keep_user_data: false,
        };
        let outcome = h.orchestrator.remediate("1", wipe).await.expect("remediate");
        assert_eq!(outcome, RemediationOutcome::Declined);
        assert!(h.gateway.remediations().is_empty());
        assert_eq!(h.confirmer.prompts().len(), 1);
        assert!(h.confirmer.prompts()[0].contains("DEVICE-1"));

        let outcome = h
            .orchestrator
            .remediate("1", RemediationAction::Sync)
            .await
            .expect("sync");
        assert_eq!(outcome, RemediationOutcome::Completed);
        assert_eq!(h.confirmer.prompts().len(), 1);
        assert_eq!(h.gateway.remediations(), vec![("1".to_string(), "sync".to_string())]);
    }

    #[tokio::test]
    async fn test_confirmed_reboot_reaches_gateway() {
        let h = harness_with(FakeGateway::default(), StaticTokens::new("t"), true);

        let outcome = h
            .orchestrator
            .remediate("42", RemediationAction::Reboot)
            .await
            .expect("reboot");

        assert_eq!(outcome, RemediationOutcome::Completed);
        assert_eq!(h.gateway.remediations(), vec![("42".to_string(), "reboot".to_string())]);
        assert!(h.confirmer.prompts()[0].contains("42"));
    }

    #[tokio::test]
    async fn test_progress_ends_terminal() {
        let h = harness(five_with_two_failing());
        let progress = h.orchestrator.subscribe();

        h.orchestrator.load_data(false).await;

        let last = progress.borrow().clone();
        assert_eq!(last.state, SyncState::Done);
        assert!(!last.in_progress);
        assert!(!h.orchestrator.is_syncing());
    }

    #[tokio::test]
    async fn test_refresh_walks_states_in_order() {
        let h = harness(five_with_two_failing());
        let mut progress = h.orchestrator.subscribe();
        let recorder = tokio::spawn(async move {
            let mut states = Vec::new();
            while progress.changed().await.is_ok() {
                let state = progress.borrow_and_update().state;
                states.push(state);
                if state.is_terminal() {
                    break;
                }
            }
            states
        });

        let outcome = h.orchestrator.load_data(false).await;

        assert_eq!(outcome.state, SyncState::Done);
        assert_eq!(
            recorder.await.expect("recorder"),
            vec![
                SyncState::CheckCache,
                SyncState::Authenticating,
                SyncState::Fetching,
                SyncState::Enriching,
                SyncState::Persisting,
                SyncState::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_timed_out_empty_listing_fails() {
        let h = harness(five_with_two_failing().timing_out_after(0));

        let outcome = h.orchestrator.load_data(false).await;

        assert_eq!(outcome.state, SyncState::Failed);
        assert_eq!(outcome.source, DataSource::Empty);
        assert!(matches!(outcome.error, Some(SyncError::RemoteTimeout(_))));
        assert_eq!(h.gateway.compliance_calls(), 0);
        assert!(h.cache.get_stale::<Vec<DeviceRecord>>(CacheKey::Devices).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_device_write_keeps_datasets_consistent() {
        let h = harness(five_with_two_failing());
        let previous = located_fleet(3, 0);
        let seeded_at = seed(&h.cache, &previous, Duration::hours(1)).await;
        h.cache
            .put_captured_at(CacheKey::Stats, &AggregateStats::from_devices(&previous), seeded_at)
            .await
            .expect("seed stats");
        std::fs::remove_dir_all(h.cache.cache_dir()).expect("remove cache dir");

        let outcome = h.orchestrator.load_data(true).await;

        assert_eq!(outcome.state, SyncState::Done);
        assert_eq!(outcome.devices.len(), 5);
        assert_eq!(outcome.warnings.len(), 1);

        let cached = h.cache.get::<Vec<DeviceRecord>>(CacheKey::Devices).await.expect("previous devices");
        let stats = h.orchestrator.get_quick_stats().await;
        assert_eq!(cached.data.len(), 3);
        assert_eq!(stats.data.total_devices, cached.data.len());
    }

    #[tokio::test]
    async fn test_failed_derived_write_is_dropped() {
        let h = harness(five_with_two_failing());
        let previous = located_fleet(3, 0);
        let seeded_at = seed(&h.cache, &previous, Duration::hours(1)).await;
        h.cache
            .put_captured_at(CacheKey::Stats, &AggregateStats::from_devices(&previous), seeded_at)
            .await
            .expect("seed stats");
        // A directory in place of the stats file makes its rename fail
        let stats_path = h.cache.cache_dir().join("stats.json");
        std::fs::remove_file(&stats_path).expect("remove stats file");
        std::fs::create_dir(&stats_path).expect("block stats file");

        let outcome = h.orchestrator.load_data(true).await;

        assert_eq!(outcome.warnings.len(), 1);
        assert!(h.cache.get::<AggregateStats>(CacheKey::Stats).await.is_none());
        assert!(h
            .cache
            .get::<ComplianceByPolicy>(CacheKey::ComplianceByPolicy)
            .await
            .is_some());

        let stats = h.orchestrator.get_quick_stats().await;
        assert_eq!(stats.data.total_devices, 5);
        assert_eq!(h.gateway.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_configuration_profiles_pass_through() {
        let profiles = vec![ConfigProfile {
            id: "cfg-1".to_string(),
            display_name: "Wi-Fi Corp".to_string(),
            state: "error".to_string(),
            version: Some(2),
        }];
        let h = harness(FakeGateway::default().with_profiles(profiles.clone()));

        let fetched = h.orchestrator.configuration_profiles("1").await.expect("profiles");

        assert_eq!(fetched, profiles);
        assert!(fetched[0].is_failing());
    }

    #[tokio::test]
    async fn test_sign_out_invalidates_tokens() {
        let h = harness(FakeGateway::default());

        h.orchestrator.sign_out().await.expect("sign out");

        assert_eq!(h.tokens.invalidations(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_forced_refreshes_are_tolerated() {
        let h = harness(five_with_two_failing());

        let (a, b) = tokio::join!(h.orchestrator.load_data(true), h.orchestrator.load_data(true));

        assert_eq!(a.devices.len(), 5);
        assert_eq!(b.devices.len(), 5);
        assert_eq!(h.gateway.list_calls(), 2);
        let cached = h.cache.get::<Vec<DeviceRecord>>(CacheKey::Devices).await.expect("cached");
        assert_eq!(cached.data.len(), 5);
    }
}
