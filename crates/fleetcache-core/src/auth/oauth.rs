//! OAuth 2.0 client for a Microsoft-identity-style v2 endpoint.
//!
//! Silent renewal uses the `refresh_token` grant. The interactive path is the
//! device-code flow: the user code is handed to a `DeviceCodePrompt` supplied
//! by the presentation layer and the token endpoint is polled until the user
//! finishes signing in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{AuthError, Credential, TokenGrant};

/// Default authority host for the identity platform.
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Scopes needed to read managed devices, run remediation actions and read
/// owner profiles, plus `offline_access` for a refresh token.
pub const GRAPH_SCOPES: &str = "https://graph.microsoft.com/DeviceManagementManagedDevices.ReadWrite.All \
https://graph.microsoft.com/DeviceManagementManagedDevices.PrivilegedOperations.All \
https://graph.microsoft.com/User.Read.All offline_access";

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Extra wait the server asks for with `slow_down`.
const SLOW_DOWN_STEP_SECS: u64 = 5;

/// Acquires tokens from the identity provider.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Exchange a stored long-lived grant for a fresh token without user
    /// interaction.
    async fn renew_silently(&self, refresh_token: &str) -> Result<TokenGrant, AuthError>;

    /// Sign in with live user action. The only path allowed to block on the
    /// user.
    async fn sign_in_interactive(&self) -> Result<TokenGrant, AuthError>;
}

/// What the user needs to finish a device-code sign-in.
#[derive(Debug, Clone)]
pub struct DeviceCodeChallenge {
    pub user_code: String,
    pub verification_uri: String,
    pub message: String,
    pub expires_in: Duration,
}

/// Presentation-layer capability that shows the device-code challenge.
#[async_trait]
pub trait DeviceCodePrompt: Send + Sync {
    async fn show(&self, challenge: &DeviceCodeChallenge);
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    #[serde(default = "default_poll_interval")]
    interval: u64,
    message: Option<String>,
}

fn default_poll_interval() -> u64 {
    5
}

/// Failure from the token or device-code endpoint, before it is mapped to
/// an `AuthError`. The device-code poll needs the raw OAuth code.
enum EndpointError {
    OAuth { code: String, description: String },
    Other(AuthError),
}

impl From<EndpointError> for AuthError {
    fn from(err: EndpointError) -> Self {
        match err {
            EndpointError::OAuth { code, description } => AuthError::from_oauth_code(&code, &description),
            EndpointError::Other(e) => e,
        }
    }
}

impl From<reqwest::Error> for EndpointError {
    fn from(err: reqwest::Error) -> Self {
        EndpointError::Other(err.into())
    }
}

pub struct OAuthAuthenticator {
    client: Client,
    authority: String,
    client_id: String,
    scopes: String,
    prompt: Arc<dyn DeviceCodePrompt>,
}

impl OAuthAuthenticator {
    pub fn new(
        authority_host: &str,
        tenant_id: &str,
        client_id: &str,
        prompt: Arc<dyn DeviceCodePrompt>,
    ) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(AuthError::from)?;

        Ok(Self {
            client,
            authority: format!(
                "{}/{}/oauth2/v2.0",
                authority_host.trim_end_matches('/'),
                tenant_id
            ),
            client_id: client_id.to_string(),
            scopes: GRAPH_SCOPES.to_string(),
            prompt,
        })
    }

    /// Override the requested scopes.
    pub fn with_scopes(mut self, scopes: impl Into<String>) -> Self {
        self.scopes = scopes.into();
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.authority, path)
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<T, EndpointError> {
        let response = self.client.post(self.endpoint(path)).form(form).send().await?;
        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| {
                EndpointError::Other(AuthError::Rejected(format!("invalid response from {}: {}", path, e)))
            });
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(EndpointError::Other(AuthError::Transient(format!(
                "{} endpoint returned {}",
                path, status
            ))));
        }
        match serde_json::from_str::<OAuthErrorResponse>(&body) {
            Ok(err) => Err(EndpointError::OAuth {
                code: err.error,
                description: err.error_description,
            }),
            Err(_) => Err(EndpointError::Other(AuthError::Rejected(format!(
                "{} endpoint returned {}",
                path, status
            )))),
        }
    }

    fn into_grant(token: TokenResponse) -> TokenGrant {
        TokenGrant {
            credential: Credential::new(token.access_token, token.expires_in),
            refresh_token: token.refresh_token,
            account: None,
        }
    }
}

#[async_trait]
impl Authenticator for OAuthAuthenticator {
    async fn renew_silently(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        debug!("Renewing token with refresh grant");
        let token: TokenResponse = self
            .post_form(
                "token",
                &[
                    ("grant_type", "refresh_token"),
                    ("client_id", self.client_id.as_str()),
                    ("refresh_token", refresh_token),
                    ("scope", self.scopes.as_str()),
                ],
            )
            .await?;
        Ok(Self::into_grant(token))
    }

    async fn sign_in_interactive(&self) -> Result<TokenGrant, AuthError> {
        let challenge: DeviceCodeResponse = self
            .post_form(
                "devicecode",
                &[("client_id", self.client_id.as_str()), ("scope", self.scopes.as_str())],
            )
            .await?;

        let message = challenge.message.clone().unwrap_or_else(|| {
            format!(
                "To sign in, open {} and enter the code {}",
                challenge.verification_uri, challenge.user_code
            )
        });
        self.prompt
            .show(&DeviceCodeChallenge {
                user_code: challenge.user_code.clone(),
                verification_uri: challenge.verification_uri.clone(),
                message,
                expires_in: Duration::from_secs(challenge.expires_in),
            })
            .await;
        info!("Waiting for device-code sign-in to complete");

        let deadline = Instant::now() + Duration::from_secs(challenge.expires_in);
        let mut interval = Duration::from_secs(challenge.interval.max(1));
        loop {
            tokio::time::sleep(interval).await;
            if Instant::now() >= deadline {
                return Err(AuthError::Rejected(
                    "device code expired before sign-in completed".to_string(),
                ));
            }

            let polled: Result<TokenResponse, EndpointError> = self
                .post_form(
                    "token",
                    &[
                        ("grant_type", DEVICE_CODE_GRANT),
                        ("client_id", self.client_id.as_str()),
                        ("device_code", challenge.device_code.as_str()),
                    ],
                )
                .await;

            match polled {
                Ok(token) => return Ok(Self::into_grant(token)),
                Err(EndpointError::OAuth { code, .. }) if code == "authorization_pending" => continue,
                Err(EndpointError::OAuth { code, .. }) if code == "slow_down" => {
                    interval += Duration::from_secs(SLOW_DOWN_STEP_SECS);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
