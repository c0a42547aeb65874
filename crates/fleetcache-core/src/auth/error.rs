use thiserror::Error;

/// Failures of token acquisition.
///
/// `Clone` so that one in-flight acquisition can hand the same outcome to
/// every waiting caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Interactive sign-in required: {0}")]
    InteractionRequired(String),

    #[error("Temporary authentication failure: {0}")]
    Transient(String),

    #[error("Authentication rejected: {0}")]
    Rejected(String),

    #[error("Token cache error: {0}")]
    Store(String),
}

impl AuthError {
    /// Only transient failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::Transient(_))
    }

    /// Map an OAuth error code from the token endpoint.
    pub fn from_oauth_code(code: &str, description: &str) -> Self {
        match code {
            "invalid_grant" | "interaction_required" | "login_required" | "consent_required" => {
                AuthError::InteractionRequired(format!("{}: {}", code, description))
            }
            "temporarily_unavailable" | "server_error" => {
                AuthError::Transient(format!("{}: {}", code, description))
            }
            _ => AuthError::Rejected(format!("{}: {}", code, description)),
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Transient(format!("network error: {}", err))
    }
}
