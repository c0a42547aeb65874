use thiserror::Error;

use crate::auth::AuthError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    Server(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl GatewayError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => GatewayError::Unauthorized,
            403 => GatewayError::AccessDenied(truncated),
            404 => GatewayError::NotFound(truncated),
            429 => GatewayError::RateLimited,
            500..=599 => GatewayError::Server(truncated),
            _ => GatewayError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            GatewayError::Timeout(_) => true,
            GatewayError::Network(e) => e.is_timeout(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }
}
