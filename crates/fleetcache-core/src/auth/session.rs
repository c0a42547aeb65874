use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Buffer before expiry inside which a cached token is renewed (5 minutes).
pub const TOKEN_REFRESH_BUFFER_MINUTES: i64 = 5;

/// An access token and the instant it stops being accepted. Lives only in
/// the broker's memory.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credential {
    pub fn new(access_token: String, expires_in_secs: i64) -> Self {
        Self {
            access_token,
            expires_at: Utc::now() + Duration::seconds(expires_in_secs),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// True once the token is within the refresh buffer of its expiry.
    pub fn needs_refresh(&self) -> bool {
        self.expires_at <= Utc::now() + Duration::minutes(TOKEN_REFRESH_BUFFER_MINUTES)
    }

    pub fn minutes_until_expiry(&self) -> i64 {
        (self.expires_at - Utc::now()).num_minutes().max(0)
    }
}

/// Result of a successful sign-in or renewal.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub credential: Credential,
    /// Long-lived grant for silent renewal, when the server issued one.
    pub refresh_token: Option<String>,
    pub account: Option<String>,
}

/// The part of a grant that survives restarts, persisted encrypted by the
/// token cache.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredGrant {
    pub refresh_token: String,
    pub account: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for StoredGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredGrant")
            .field("refresh_token", &"<redacted>")
            .field("account", &self.account)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}
