//! Proxy-managed API keys: opaque tokens that the proxy translates to real
//! upstream keys at the edge.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::ApiKeysConfig;
use crate::error::Result;

/// Prefix marking a proxy-owned opaque key. Anything else in an auth header
/// is assumed to be a real upstream credential and forwarded untouched.
pub const PROXY_KEY_PREFIX: &str = "iw:";

pub fn is_proxy_key(token: &str) -> bool {
    token.starts_with(PROXY_KEY_PREFIX)
}

#[derive(Clone)]
pub struct ResolvedKey {
    pub upstream_key: String,
    /// Provider the key is bound to; empty means any.
    pub provider: String,
}

impl std::fmt::Debug for ResolvedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedKey")
            .field("upstream_key", &"<redacted>")
            .field("provider", &self.provider)
            .finish()
    }
}

/// Key lookup backend. The production store may be remote; `resolve` returns
/// `None` for tokens the store does not know.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<Option<ResolvedKey>>;
}

/// Store backed by the `features.api_keys.keys` config list.
#[derive(Default)]
pub struct ConfigKeyStore {
    keys: HashMap<String, ResolvedKey>,
}

impl ConfigKeyStore {
    pub fn from_config(config: &ApiKeysConfig) -> Self {
        let keys = config
            .keys
            .iter()
            .map(|entry| {
                (
                    entry.token.clone(),
                    ResolvedKey {
                        upstream_key: entry.upstream_key.clone(),
                        provider: entry.provider.clone(),
                    },
                )
            })
            .collect();
        Self { keys }
    }

    pub fn insert(&mut self, token: impl Into<String>, key: ResolvedKey) {
        self.keys.insert(token.into(), key);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl ApiKeyStore for ConfigKeyStore {
    async fn resolve(&self, token: &str) -> Result<Option<ResolvedKey>> {
        Ok(self.keys.get(token).cloned())
    }
}
