use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use argon2::Argon2;
use async_trait::async_trait;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use keyring::Entry;
use rand::RngCore;
use tracing::{debug, warn};

use super::AuthError;

/// Keychain service name for the token cache key.
const SERVICE_NAME: &str = "fleetcache";

/// Keychain account holding the random secret the cache key is derived from.
const KEY_ACCOUNT: &str = "token-cache-key";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;

/// Persisted, opaque token cache. The broker reads it before acquiring a
/// token and writes it after any acquisition that changed state.
#[async_trait]
pub trait TokenCache: Send + Sync {
    async fn read(&self) -> Result<Option<Vec<u8>>, AuthError>;
    async fn write(&self, blob: &[u8]) -> Result<(), AuthError>;
    async fn clear(&self) -> Result<(), AuthError>;
}

// ============================================================================
// Keychain secret
// ============================================================================

#[derive(Clone)]
enum KeySource {
    Keychain,
    Secret(String),
}

impl KeySource {
    fn secret(&self) -> Result<String, AuthError> {
        match self {
            KeySource::Secret(secret) => Ok(secret.clone()),
            KeySource::Keychain => keychain_secret(),
        }
    }
}

/// Load the cache secret from the OS keychain, creating it on first use.
fn keychain_secret() -> Result<String, AuthError> {
    let entry = Entry::new(SERVICE_NAME, KEY_ACCOUNT)
        .map_err(|e| AuthError::Store(format!("failed to open keychain entry: {}", e)))?;

    match entry.get_password() {
        Ok(secret) => Ok(secret),
        Err(keyring::Error::NoEntry) => {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            let secret: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
            entry
                .set_password(&secret)
                .map_err(|e| AuthError::Store(format!("failed to store key in keychain: {}", e)))?;
            debug!("Created token cache key in keychain");
            Ok(secret)
        }
        Err(e) => Err(AuthError::Store(format!("failed to read key from keychain: {}", e))),
    }
}

fn derive_key(secret: &str, salt: &[u8]) -> Result<[u8; 32], AuthError> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(secret.as_bytes(), salt, &mut key)
        .map_err(|e| AuthError::Store(format!("key derivation failed: {}", e)))?;
    Ok(key)
}

/// Encrypt into `salt || nonce || ciphertext`.
fn seal(secret: &str, plaintext: &[u8]) -> Result<Vec<u8>, AuthError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let key = derive_key(secret, &salt)?;
    let cipher = XChaCha20Poly1305::new_from_slice(&key)
        .map_err(|_| AuthError::Store("invalid token cache key".to_string()))?;
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| AuthError::Store("token cache encryption failed".to_string()))?;

    let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

fn open(secret: &str, blob: &[u8]) -> Result<Vec<u8>, AuthError> {
    if blob.len() <= SALT_LEN + NONCE_LEN {
        return Err(AuthError::Store("token cache file is truncated".to_string()));
    }
    let (salt, rest) = blob.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(secret, salt)?;
    let cipher = XChaCha20Poly1305::new_from_slice(&key)
        .map_err(|_| AuthError::Store("invalid token cache key".to_string()))?;
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| AuthError::Store("token cache could not be decrypted".to_string()))
}

fn store_io(context: &str, err: io::Error) -> AuthError {
    AuthError::Store(format!("{}: {}", context, err))
}

fn join_error(err: tokio::task::JoinError) -> AuthError {
    AuthError::Store(format!("token cache task failed: {}", err))
}

// ============================================================================
// Encrypted file cache
// ============================================================================

/// Token cache stored as one encrypted file. The key is derived with Argon2id
/// from a secret kept in the OS keychain.
pub struct EncryptedFileTokenCache {
    path: PathBuf,
    key_source: KeySource,
}

impl EncryptedFileTokenCache {
    /// Cache whose key secret lives in the OS keychain.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            key_source: KeySource::Keychain,
        }
    }

    /// Cache keyed by an explicit secret, for headless environments.
    pub fn with_secret(path: PathBuf, secret: impl Into<String>) -> Self {
        Self {
            path,
            key_source: KeySource::Secret(secret.into()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }
}

#[async_trait]
impl TokenCache for EncryptedFileTokenCache {
    async fn read(&self) -> Result<Option<Vec<u8>>, AuthError> {
        let blob = match tokio::fs::read(&self.path).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_io("failed to read token cache", e)),
        };

        let key_source = self.key_source.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>, AuthError> {
            let secret = key_source.secret()?;
            match open(&secret, &blob) {
                Ok(plaintext) => Ok(Some(plaintext)),
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable token cache");
                    Ok(None)
                }
            }
        })
        .await
        .map_err(join_error)?
    }

    async fn write(&self, blob: &[u8]) -> Result<(), AuthError> {
        let key_source = self.key_source.clone();
        let plaintext = blob.to_vec();
        let sealed = tokio::task::spawn_blocking(move || {
            let secret = key_source.secret()?;
            seal(&secret, &plaintext)
        })
        .await
        .map_err(join_error)??;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| store_io("failed to create token cache directory", e))?;
        }
        let temp_path = self.temp_path();
        tokio::fs::write(&temp_path, sealed)
            .await
            .map_err(|e| store_io("failed to write token cache temp file", e))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| store_io("failed to rename token cache file", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| store_io("failed to set token cache permissions", e))?;
        }

        Ok(())
    }

    async fn clear(&self) -> Result<(), AuthError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_io("failed to delete token cache", e)),
        }
    }
}

// ============================================================================
// In-memory cache
// ============================================================================

/// Non-persistent token cache; the grant is forgotten on exit.
#[derive(Default)]
pub struct MemoryTokenCache {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(blob: Vec<u8>) -> Self {
        Self {
            blob: Mutex::new(Some(blob)),
        }
    }

    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.blob.lock().ok().and_then(|guard| guard.clone())
    }

    fn poisoned() -> AuthError {
        AuthError::Store("token cache lock poisoned".to_string())
    }
}

#[async_trait]
impl TokenCache for MemoryTokenCache {
    async fn read(&self) -> Result<Option<Vec<u8>>, AuthError> {
        self.blob
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| Self::poisoned())
    }

    async fn write(&self, blob: &[u8]) -> Result<(), AuthError> {
        let mut guard = self.blob.lock().map_err(|_| Self::poisoned())?;
        *guard = Some(blob.to_vec());
        Ok(())
    }

    async fn clear(&self) -> Result<(), AuthError> {
        let mut guard = self.blob.lock().map_err(|_| Self::poisoned())?;
        *guard = None;
        Ok(())
    }
}
