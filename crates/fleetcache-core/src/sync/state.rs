use std::fmt;

use serde::Serialize;

/// Stage of one sync request.
///
/// ```text
/// Idle -> CheckCache -> CacheHit
///                    \-> Authenticating -> Fetching -> Enriching -> Persisting -> Done
/// ```
/// A cache hit with poor location coverage continues from `CacheHit`
/// through `Authenticating`, `Enriching` and `Persisting` without fetching.
/// Any stage may end in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    CheckCache,
    CacheHit,
    Authenticating,
    Fetching,
    Enriching,
    Persisting,
    Done,
    Failed,
}

impl SyncState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncState::Idle | SyncState::CacheHit | SyncState::Done | SyncState::Failed
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            SyncState::Idle => "Idle",
            SyncState::CheckCache => "Checking cache...",
            SyncState::CacheHit => "Loaded from cache",
            SyncState::Authenticating => "Signing in...",
            SyncState::Fetching => "Fetching devices...",
            SyncState::Enriching => "Checking compliance and locations...",
            SyncState::Persisting => "Saving...",
            SyncState::Done => "Up to date",
            SyncState::Failed => "Sync failed",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Snapshot published to subscribers on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct SyncProgress {
    pub state: SyncState,
    pub status: String,
    pub in_progress: bool,
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            status: SyncState::Idle.label().to_string(),
            in_progress: false,
        }
    }
}

impl SyncProgress {
    pub fn new(state: SyncState, status: impl Into<String>) -> Self {
        Self {
            state,
            status: status.into(),
            in_progress: !state.is_terminal(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_progress_follows_state() {
        assert!(SyncProgress::new(SyncState::Fetching, "x").in_progress);
        assert!(!SyncProgress::new(SyncState::Done, "x").in_progress);
        assert!(!SyncProgress::new(SyncState::CacheHit, "x").in_progress);
        assert!(!SyncProgress::default().in_progress);
    }
}
