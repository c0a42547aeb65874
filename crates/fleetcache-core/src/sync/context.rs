use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::api::{DeviceGateway, GraphClient};
use crate::auth::{
    CredentialBroker, DeviceCodePrompt, EncryptedFileTokenCache, OAuthAuthenticator, TokenProvider,
};
use crate::cache::TieredCache;
use crate::config::{Config, SyncSettings};

/// Asks the user to approve a high-risk action. Supplied by the
/// presentation layer.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Everything the orchestrator depends on, built once per process and
/// handed over at construction.
#[derive(Clone)]
pub struct ServiceContext {
    pub settings: SyncSettings,
    pub tokens: Arc<dyn TokenProvider>,
    pub gateway: Arc<dyn DeviceGateway>,
    pub cache: Arc<TieredCache>,
    pub confirmer: Arc<dyn Confirmer>,
}

impl ServiceContext {
    pub fn new(
        settings: SyncSettings,
        tokens: Arc<dyn TokenProvider>,
        gateway: Arc<dyn DeviceGateway>,
        cache: Arc<TieredCache>,
        confirmer: Arc<dyn Confirmer>,
    ) -> Self {
        Self {
            settings,
            tokens,
            gateway,
            cache,
            confirmer,
        }
    }

    /// Wire the production services: OAuth sign-in behind a credential
    /// broker with an encrypted token cache, the Graph client and the
    /// per-tenant cache directory.
    pub fn from_config(
        config: &Config,
        prompt: Arc<dyn DeviceCodePrompt>,
        confirmer: Arc<dyn Confirmer>,
    ) -> Result<Self> {
        let tenant_id = config.tenant_id()?;
        let client_id = config.client_id()?;
        let settings = config.sync.clone();

        let cache_dir = config.cache_dir()?;
        let cache = TieredCache::with_expiry(cache_dir.clone(), settings.cache_expiry())
            .with_context(|| format!("Failed to open cache at {}", cache_dir.display()))?;

        let authenticator =
            OAuthAuthenticator::new(&config.authority_host, tenant_id, client_id, prompt)
                .context("Failed to create authenticator")?;
        let token_cache = EncryptedFileTokenCache::new(config.token_cache_path()?);
        let broker = CredentialBroker::with_retry(
            Arc::new(authenticator),
            Arc::new(token_cache),
            settings.retry_policy(),
        );
        let tokens: Arc<dyn TokenProvider> = Arc::new(broker);

        let gateway = GraphClient::new(&config.graph_url, Arc::clone(&tokens))
            .context("Failed to create Graph client")?
            .with_detail_timeout(settings.detail_timeout());

        debug!(tenant = tenant_id, cache_dir = %cache_dir.display(), "Service context ready");

        Ok(Self::new(
            settings,
            tokens,
            Arc::new(gateway),
            Arc::new(cache),
            confirmer,
        ))
    }
}
