//! Authentication module for acquiring and renewing Graph access tokens.
//!
//! This module provides:
//! - `CredentialBroker`: single-flight token acquisition with silent renewal,
//!   interactive fallback and bounded backoff
//! - `OAuthAuthenticator`: refresh-token and device-code flows against the
//!   identity platform
//! - `EncryptedFileTokenCache`: the persisted grant, encrypted with a key
//!   held in the OS keychain
//!
//! Access tokens are renewed 5 minutes before they expire.

pub mod broker;
pub mod credentials;
pub mod error;
pub mod oauth;
pub mod session;

pub use broker::{CredentialBroker, RetryPolicy, TokenProvider};
pub use credentials::{EncryptedFileTokenCache, MemoryTokenCache, TokenCache};
pub use error::AuthError;
pub use oauth::{
    Authenticator, DeviceCodeChallenge, DeviceCodePrompt, OAuthAuthenticator,
    DEFAULT_AUTHORITY_HOST, GRAPH_SCOPES,
};
pub use session::{Credential, StoredGrant, TokenGrant, TOKEN_REFRESH_BUFFER_MINUTES};
