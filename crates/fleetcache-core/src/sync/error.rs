use thiserror::Error;

use crate::api::GatewayError;
use crate::auth::AuthError;
use crate::cache::CacheError;

/// Failures a sync request reports to its caller.
///
/// Per-device lookup failures never appear here; they are recorded on the
/// device and summarized as `PartialEnrichmentFailure` in a warning.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Sign-in required: {0}")]
    AuthRequired(String),

    #[error("Authentication temporarily unavailable: {0}")]
    AuthTransient(String),

    #[error("Device service timed out: {0}")]
    RemoteTimeout(String),

    #[error("Device service unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Cache entry is corrupt: {0}")]
    CacheCorrupt(String),

    #[error("Cache could not be written: {0}")]
    CacheWrite(String),

    #[error("{failed} enrichment lookup(s) failed")]
    PartialEnrichmentFailure { failed: usize },
}

impl SyncError {
    /// Whether trying again later may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::AuthTransient(_) | SyncError::RemoteTimeout(_) | SyncError::RemoteUnavailable(_)
        )
    }
}

impl From<AuthError> for SyncError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InteractionRequired(msg) | AuthError::Rejected(msg) => {
                SyncError::AuthRequired(msg)
            }
            AuthError::Transient(msg) | AuthError::Store(msg) => SyncError::AuthTransient(msg),
        }
    }
}

impl From<GatewayError> for SyncError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Auth(e) => e.into(),
            e @ GatewayError::Unauthorized => SyncError::AuthRequired(e.to_string()),
            e if e.is_timeout() => SyncError::RemoteTimeout(e.to_string()),
            e => SyncError::RemoteUnavailable(e.to_string()),
        }
    }
}

impl From<CacheError> for SyncError {
    fn from(err: CacheError) -> Self {
        match err {
            e @ CacheError::Corrupt { .. } => SyncError::CacheCorrupt(e.to_string()),
            e => SyncError::CacheWrite(e.to_string()),
        }
    }
}
