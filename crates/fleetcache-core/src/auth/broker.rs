//! Single-flight, auto-renewing access-token broker.
//!
//! Every caller goes through one async gate. A cached token outside the
//! refresh buffer is returned straight away; otherwise the first caller
//! starts an acquisition and every concurrent caller awaits that same
//! attempt and receives its result.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{AuthError, Authenticator, Credential, StoredGrant, TokenCache, TokenGrant};

/// Attempts per acquisition path before a transient failure is terminal.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// First backoff delay; doubles after every transient failure.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Supplies bearer tokens to remote calls.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, AuthError>;

    /// Drop the cached token, e.g. after the remote API answered 401.
    async fn invalidate(&self);

    /// Forget any persisted sign-in.
    async fn sign_out(&self) -> Result<(), AuthError> {
        self.invalidate().await;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

type Flight = Shared<BoxFuture<'static, Result<Credential, AuthError>>>;

#[derive(Default)]
struct GateState {
    credential: Option<Credential>,
    in_flight: Option<Flight>,
}

struct BrokerInner {
    authenticator: Arc<dyn Authenticator>,
    token_cache: Arc<dyn TokenCache>,
    retry: RetryPolicy,
    gate: Mutex<GateState>,
    acquisitions: AtomicU64,
}

/// Clone is cheap; clones share the gate and the cached token.
#[derive(Clone)]
pub struct CredentialBroker {
    inner: Arc<BrokerInner>,
}

impl CredentialBroker {
    pub fn new(authenticator: Arc<dyn Authenticator>, token_cache: Arc<dyn TokenCache>) -> Self {
        Self::with_retry(authenticator, token_cache, RetryPolicy::default())
    }

    pub fn with_retry(
        authenticator: Arc<dyn Authenticator>,
        token_cache: Arc<dyn TokenCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                authenticator,
                token_cache,
                retry,
                gate: Mutex::new(GateState::default()),
                acquisitions: AtomicU64::new(0),
            }),
        }
    }

    /// Return a valid access token, acquiring one if needed.
    pub async fn get_token(&self) -> Result<String, AuthError> {
        let flight = {
            let mut gate = self.inner.gate.lock().await;
            if let Some(credential) = gate.credential.as_ref() {
                if !credential.needs_refresh() {
                    return Ok(credential.access_token.clone());
                }
                debug!(
                    minutes_left = credential.minutes_until_expiry(),
                    "Cached token inside refresh buffer"
                );
            }

            match gate.in_flight.as_ref() {
                Some(flight) => {
                    debug!("Joining in-flight token acquisition");
                    flight.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let flight = async move { inner.acquire().await }.boxed().shared();
                    gate.in_flight = Some(flight.clone());
                    flight
                }
            }
        };

        let result = flight.clone().await;

        let mut gate = self.inner.gate.lock().await;
        if gate
            .in_flight
            .as_ref()
            .is_some_and(|current| current.ptr_eq(&flight))
        {
            gate.in_flight = None;
            match &result {
                Ok(credential) => gate.credential = Some(credential.clone()),
                Err(_) => gate.credential = None,
            }
        }
        drop(gate);

        result.map(|credential| credential.access_token)
    }

    /// Forget the in-memory token and the persisted grant.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.inner.gate.lock().await.credential = None;
        self.inner.token_cache.clear().await?;
        info!("Signed out");
        Ok(())
    }

    /// Number of acquisition attempts started so far.
    pub fn acquisition_count(&self) -> u64 {
        self.inner.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for CredentialBroker {
    async fn access_token(&self) -> Result<String, AuthError> {
        self.get_token().await
    }

    async fn invalidate(&self) {
        let mut gate = self.inner.gate.lock().await;
        if gate.credential.take().is_some() {
            debug!("Cached token invalidated");
        }
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        CredentialBroker::sign_out(self).await
    }
}

impl BrokerInner {
    async fn acquire(self: Arc<Self>) -> Result<Credential, AuthError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);

        let stored = self.load_grant().await;
        let account = stored.as_ref().and_then(|g| g.account.clone());

        let grant = match stored {
            Some(stored) => {
                let renewal = self
                    .with_retry("silent renewal", || {
                        self.authenticator.renew_silently(&stored.refresh_token)
                    })
                    .await;
                match renewal {
                    Ok(grant) => grant,
                    Err(AuthError::InteractionRequired(reason)) => {
                        info!(reason = %reason, "Silent renewal needs interaction, falling back to sign-in");
                        self.interactive().await?
                    }
                    Err(e) => return Err(e),
                }
            }
            None => {
                debug!("No stored grant, starting interactive sign-in");
                self.interactive().await?
            }
        };

        self.save_grant(&grant, account).await;
        info!(expires_at = %grant.credential.expires_at, "Access token acquired");
        Ok(grant.credential)
    }

    async fn interactive(&self) -> Result<TokenGrant, AuthError> {
        self.with_retry("interactive sign-in", || self.authenticator.sign_in_interactive())
            .await
    }

    async fn with_retry<F, Fut>(&self, label: &str, mut attempt_fn: F) -> Result<TokenGrant, AuthError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<TokenGrant, AuthError>>,
    {
        let mut attempt = 1;
        loop {
            match attempt_fn().await {
                Ok(grant) => return Ok(grant),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        flow = label,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Token acquisition failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(AuthError::Transient(reason)) => {
                    return Err(AuthError::Transient(format!(
                        "{} failed after {} attempts: {}",
                        label, attempt, reason
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load_grant(&self) -> Option<StoredGrant> {
        match self.token_cache.read().await {
            Ok(Some(blob)) => match serde_json::from_slice::<StoredGrant>(&blob) {
                Ok(grant) => Some(grant),
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed stored grant");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read token cache");
                None
            }
        }
    }

    async fn save_grant(&self, grant: &TokenGrant, previous_account: Option<String>) {
        let Some(refresh_token) = grant.refresh_token.clone() else {
            debug!("No refresh token issued, keeping stored grant");
            return;
        };

        let stored = StoredGrant {
            refresh_token,
            account: grant.account.clone().or(previous_account),
            updated_at: Utc::now(),
        };
        let blob = match serde_json::to_vec(&stored) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(error = %e, "Failed to serialize grant");
                return;
            }
        };
        if let Err(e) = self.token_cache.write(&blob).await {
            warn!(error = %e, "Failed to persist grant");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryTokenCache;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Scripted authenticator: pops one outcome per call.
    #[derive(Default)]
    struct ScriptedAuth {
        silent: StdMutex<VecDeque<Result<TokenGrant, AuthError>>>,
        interactive: StdMutex<VecDeque<Result<TokenGrant, AuthError>>>,
        silent_calls: AtomicU64,
        interactive_calls: AtomicU64,
        delay: Duration,
    }

    impl ScriptedAuth {
        fn silent(self, outcomes: Vec<Result<TokenGrant, AuthError>>) -> Self {
            *self.silent.lock().unwrap() = outcomes.into();
            self
        }

        fn interactive(self, outcomes: Vec<Result<TokenGrant, AuthError>>) -> Self {
            *self.interactive.lock().unwrap() = outcomes.into();
            self
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Authenticator for ScriptedAuth {
        async fn renew_silently(&self, _refresh_token: &str) -> Result<TokenGrant, AuthError> {
            self.silent_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.silent
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AuthError::Rejected("unscripted".to_string())))
        }

        async fn sign_in_interactive(&self) -> Result<TokenGrant, AuthError> {
            self.interactive_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.interactive
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AuthError::Rejected("unscripted".to_string())))
        }
    }

    fn grant(token: &str, expires_in: i64) -> Result<TokenGrant, AuthError> {
        Ok(TokenGrant {
            credential: Credential::new(token.to_string(), expires_in),
            refresh_token: Some(format!("rt-{}", token)),
            account: Some("admin@contoso.com".to_string()),
        })
    }

    fn stored_cache() -> Arc<MemoryTokenCache> {
        let stored = StoredGrant {
            refresh_token: "rt-stored".to_string(),
            account: Some("admin@contoso.com".to_string()),
            updated_at: Utc::now(),
        };
        Arc::new(MemoryTokenCache::with_blob(serde_json::to_vec(&stored).unwrap()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_acquisition() {
        let auth = Arc::new(
            ScriptedAuth::default()
                .silent(vec![grant("shared", 3600)])
                .delayed(Duration::from_millis(500)),
        );
        let broker = CredentialBroker::new(auth.clone(), stored_cache());

        let calls = (0..8).map(|_| {
            let broker = broker.clone();
            async move { broker.get_token().await }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.as_deref() == Ok("shared")));
        assert_eq!(broker.acquisition_count(), 1);
        assert_eq!(auth.silent_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_error() {
        let auth = Arc::new(
            ScriptedAuth::default()
                .silent(vec![Err(AuthError::Rejected("unauthorized_client".to_string()))])
                .delayed(Duration::from_millis(200)),
        );
        let broker = CredentialBroker::new(auth.clone(), stored_cache());

        let calls = (0..5).map(|_| {
            let broker = broker.clone();
            async move { broker.get_token().await }
        });
        let results = futures::future::join_all(calls).await;

        let expected = Err(AuthError::Rejected("unauthorized_client".to_string()));
        assert!(results.iter().all(|r| *r == expected));
        assert_eq!(broker.acquisition_count(), 1);
    }

    #[tokio::test]
    async fn test_cached_token_fast_path() {
        let auth = Arc::new(ScriptedAuth::default().silent(vec![grant("first", 3600)]));
        let broker = CredentialBroker::new(auth.clone(), stored_cache());

        assert_eq!(broker.get_token().await.unwrap(), "first");
        assert_eq!(broker.get_token().await.unwrap(), "first");
        assert_eq!(broker.acquisition_count(), 1);
    }

    #[tokio::test]
    async fn test_token_inside_refresh_buffer_is_renewed() {
        let auth = Arc::new(
            ScriptedAuth::default().silent(vec![grant("short", 120), grant("renewed", 3600)]),
        );
        let broker = CredentialBroker::new(auth.clone(), stored_cache());

        assert_eq!(broker.get_token().await.unwrap(), "short");
        assert_eq!(broker.get_token().await.unwrap(), "renewed");
        assert_eq!(broker.acquisition_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retry_with_backoff() {
        let auth = Arc::new(ScriptedAuth::default().silent(vec![
            Err(AuthError::Transient("503".to_string())),
            Err(AuthError::Transient("503".to_string())),
            grant("third-time", 3600),
        ]));
        let broker = CredentialBroker::new(auth.clone(), stored_cache());

        let started = tokio::time::Instant::now();
        assert_eq!(broker.get_token().await.unwrap(), "third-time");
        assert_eq!(auth.silent_calls.load(Ordering::SeqCst), 3);
        // 2s after the first failure, 4s after the second
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_surfaces_terminal_error() {
        let auth = Arc::new(ScriptedAuth::default().silent(vec![
            Err(AuthError::Transient("timeout".to_string())),
            Err(AuthError::Transient("timeout".to_string())),
            Err(AuthError::Transient("timeout".to_string())),
            grant("never", 3600),
        ]));
        let cache = stored_cache();
        let broker = CredentialBroker::new(auth.clone(), cache.clone());

        let err = broker.get_token().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(auth.silent_calls.load(Ordering::SeqCst), 3);
        assert_eq!(auth.interactive_calls.load(Ordering::SeqCst), 0);

        let still_stored: StoredGrant = serde_json::from_slice(&cache.snapshot().unwrap()).unwrap();
        assert_eq!(still_stored.refresh_token, "rt-stored");
    }

    #[tokio::test]
    async fn test_interaction_required_falls_back_to_interactive() {
        let auth = Arc::new(
            ScriptedAuth::default()
                .silent(vec![Err(AuthError::InteractionRequired("invalid_grant".to_string()))])
                .interactive(vec![grant("interactive", 3600)]),
        );
        let cache = stored_cache();
        let broker = CredentialBroker::new(auth.clone(), cache.clone());

        assert_eq!(broker.get_token().await.unwrap(), "interactive");
        assert_eq!(auth.interactive_calls.load(Ordering::SeqCst), 1);

        let stored: StoredGrant = serde_json::from_slice(&cache.snapshot().unwrap()).unwrap();
        assert_eq!(stored.refresh_token, "rt-interactive");
    }

    #[tokio::test]
    async fn test_no_stored_grant_goes_interactive_and_persists() {
        let auth = Arc::new(ScriptedAuth::default().interactive(vec![grant("fresh", 3600)]));
        let cache = Arc::new(MemoryTokenCache::new());
        let broker = CredentialBroker::new(auth.clone(), cache.clone());

        assert_eq!(broker.get_token().await.unwrap(), "fresh");
        assert_eq!(auth.silent_calls.load(Ordering::SeqCst), 0);
        assert!(cache.snapshot().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_and_sign_out() {
        let auth = Arc::new(
            ScriptedAuth::default().silent(vec![grant("one", 3600), grant("two", 3600)]),
        );
        let cache = stored_cache();
        let broker = CredentialBroker::new(auth.clone(), cache.clone());

        assert_eq!(broker.get_token().await.unwrap(), "one");
        broker.invalidate().await;
        assert_eq!(broker.get_token().await.unwrap(), "two");

        broker.sign_out().await.unwrap();
        assert!(cache.snapshot().is_none());
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
    }
}
