use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{ChatConfig, Credential, ProviderKind, build_provider};
use crate::error::{ChatError, LLMError};
use crate::http::DynHttpTransport;
use crate::provider::DynProvider;
use crate::store::DynCredentialStore;

/// Resolves a provider id and a user to a ready-to-call adapter.
///
/// Credentials come from the [`crate::store::CredentialStore`] and are cached
/// per `(user, provider)` for `credential_ttl`; a miss is cached too, so a user
/// without a key does not hit the store on every request.
pub struct ProviderRegistry {
    credentials: DynCredentialStore,
    transport: DynHttpTransport,
    config: ChatConfig,
    fixed: HashMap<String, DynProvider>,
    cache: RwLock<HashMap<(String, ProviderKind), CachedCredential>>,
}

#[derive(Clone)]
struct CachedCredential {
    credential: Option<Credential>,
    fetched_at: Instant,
}

impl ProviderRegistry {
    /// 创建 Builder
    pub fn builder(
        credentials: DynCredentialStore,
        transport: DynHttpTransport,
    ) -> ProviderRegistryBuilder {
        ProviderRegistryBuilder {
            credentials,
            transport,
            config: ChatConfig::default(),
            fixed: HashMap::new(),
        }
    }

    /// Returns the adapter for `provider_id` configured with `user_id`'s credentials.
    ///
    /// # Errors
    ///
    /// [`ChatError::UnknownProvider`] for ids nobody registered,
    /// [`ChatError::ProviderNotConfigured`] when a cloud provider has no key,
    /// [`ChatError::Store`] when the credential lookup itself fails.
    pub async fn resolve(&self, provider_id: &str, user_id: &str) -> Result<DynProvider, ChatError> {
        if let Some(provider) = self.fixed.get(provider_id) {
            return Ok(provider.clone());
        }

        let kind = ProviderKind::from_id(provider_id).ok_or_else(|| ChatError::UnknownProvider {
            provider: provider_id.to_string(),
        })?;
        let credential = self.credential(user_id, kind).await?;

        build_provider(kind, credential.as_ref(), &self.config, self.transport.clone()).map_err(
            |err| {
                if !matches!(err, LLMError::Auth { .. }) {
                    warn!(provider = provider_id, error = %err, "failed to build provider");
                }
                ChatError::ProviderNotConfigured {
                    provider: provider_id.to_string(),
                }
            },
        )
    }

    /// 清除某个用户的凭据缓存 例如刚轮换了 API Key
    pub async fn invalidate(&self, user_id: &str) {
        self.cache
            .write()
            .await
            .retain(|(user, _), _| user != user_id);
    }

    /// 返回当前已注册的固定 Provider 句柄
    pub fn fixed_handles(&self) -> Vec<String> {
        self.fixed.keys().cloned().collect()
    }

    async fn credential(
        &self,
        user_id: &str,
        kind: ProviderKind,
    ) -> Result<Option<Credential>, ChatError> {
        let key = (user_id.to_string(), kind);
        let ttl = self.config.credential_ttl();

        if let Some(cached) = self.cache.read().await.get(&key) {
            if cached.fetched_at.elapsed() < ttl {
                return Ok(cached.credential.clone());
            }
        }

        let credential = self.credentials.get(user_id, kind).await?;
        debug!(
            user_id,
            provider = kind.id(),
            configured = credential.is_some(),
            "loaded provider credential"
        );
        if ttl > Duration::ZERO {
            let mut cache = self.cache.write().await;
            cache.retain(|_, cached| cached.fetched_at.elapsed() < ttl);
            cache.insert(
                key,
                CachedCredential {
                    credential: credential.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }
        Ok(credential)
    }
}

/// 负责注册固定 Provider 与配置的 Builder
pub struct ProviderRegistryBuilder {
    credentials: DynCredentialStore,
    transport: DynHttpTransport,
    config: ChatConfig,
    fixed: HashMap<String, DynProvider>,
}

impl ProviderRegistryBuilder {
    /// 使用自定义配置 包括 endpoint 与缓存时长
    pub fn config(mut self, config: ChatConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a provider shared by every user, bypassing the credential store.
    pub fn register_provider<S: Into<String>>(mut self, id: S, provider: DynProvider) -> Self {
        self.fixed.insert(id.into(), provider);
        self
    }

    /// 构建最终的 ProviderRegistry
    pub fn build(self) -> ProviderRegistry {
        ProviderRegistry {
            credentials: self.credentials,
            transport: self.transport,
            config: self.config,
            fixed: self.fixed,
            cache: RwLock::new(HashMap::new()),
        }
    }
}
