//! YAML configuration. Multiple files merge left to right: mappings merge by
//! key, anything else is replaced by the later file.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            features: FeaturesConfig::default(),
            providers: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    #[serde(default)]
    pub cost_tracking: CostTrackingConfig,
    #[serde(default)]
    pub api_keys: ApiKeysConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Quota dimensions to enforce; `user` is the minimum useful set.
    #[serde(default = "default_dimensions")]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub estimation: EstimationConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EstimationConfig {
    /// Bodies up to this size are parsed for message text; larger ones fall
    /// back to the bytes-per-token heuristic.
    #[serde(default = "default_max_sample_bytes")]
    pub max_sample_bytes: usize,
    #[serde(default = "default_per_token")]
    pub bytes_per_token: u64,
    #[serde(default = "default_per_token")]
    pub chars_per_token: u64,
    #[serde(default)]
    pub provider_chars_per_token: BTreeMap<String, u64>,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            max_sample_bytes: default_max_sample_bytes(),
            bytes_per_token: default_per_token(),
            chars_per_token: default_per_token(),
            provider_chars_per_token: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub requests_per_minute: Option<u64>,
    pub tokens_per_minute: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub tokens_per_day: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CostTrackingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "async")]
    pub async_mode: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Seconds between forced flushes of the async queue.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,
    #[serde(default)]
    pub transports: Vec<TransportConfig>,
}

impl Default for CostTrackingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            async_mode: false,
            workers: default_workers(),
            queue_size: default_queue_size(),
            flush_interval: default_flush_interval(),
            transports: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub file: Option<FileTransportConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileTransportConfig {
    pub path: String,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ApiKeysConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub keys: Vec<ApiKeyEntry>,
}

impl std::fmt::Debug for ApiKeysConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeysConfig")
            .field("enabled", &self.enabled)
            .field("keys", &format_args!("<{} redacted>", self.keys.len()))
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    /// The opaque token handed to clients (`iw:`-prefixed).
    pub token: String,
    /// Provider the key is bound to; empty means any provider.
    #[serde(default)]
    pub provider: String,
    /// The real upstream credential the proxy substitutes.
    pub upstream_key: String,
}

impl std::fmt::Debug for ApiKeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyEntry")
            .field("token", &"<redacted>")
            .field("provider", &self.provider)
            .field("upstream_key", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub pricing: Option<ModelPricingConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelPricingConfig {
    #[serde(default)]
    pub tiers: Vec<PricingTierConfig>,
    #[serde(default)]
    pub overrides: BTreeMap<String, PricingOverrideConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PricingTierConfig {
    /// Cumulative-token upper bound for this rate; 0 means unbounded.
    #[serde(default)]
    pub threshold: u64,
    /// USD per 1M input tokens.
    pub input: f64,
    /// USD per 1M output tokens.
    pub output: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PricingOverrideConfig {
    pub input: f64,
    pub output: f64,
}

impl ProxyConfig {
    /// Loads and merges one or more YAML files, left to right.
    pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        if paths.is_empty() {
            return Ok(Self::default());
        }

        let mut merged: Option<serde_yaml::Value> = None;
        for path in paths {
            let raw = std::fs::read_to_string(path.as_ref()).map_err(|err| {
                ProxyError::Config(format!("{}: {err}", path.as_ref().display()))
            })?;
            let value: serde_yaml::Value = serde_yaml::from_str(&raw)?;
            merged = Some(match merged {
                Some(base) => merge_yaml(base, value),
                None => value,
            });
        }

        let merged = merged.unwrap_or(serde_yaml::Value::Null);
        Ok(serde_yaml::from_value(merged)?)
    }

    /// One-line summary used by `--validate-config` and startup logging.
    pub fn summary(&self) -> String {
        let providers = self
            .providers
            .iter()
            .filter(|(_, provider)| provider.enabled)
            .map(|(name, provider)| format!("{name}({} models)", provider.models.len()))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "enabled={} rate_limiting={} cost_tracking={} api_keys={} providers=[{providers}]",
            self.enabled,
            self.features.rate_limiting.enabled,
            self.features.cost_tracking.enabled,
            self.features.api_keys.enabled,
        )
    }
}

fn merge_yaml(base: serde_yaml::Value, overlay: serde_yaml::Value) -> serde_yaml::Value {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(mut base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged_value = match base_map.remove(&key) {
                    Some(base_value) => merge_yaml(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged_value);
            }
            serde_yaml::Value::Mapping(base_map)
        }
        (_, overlay) => overlay,
    }
}

fn default_true() -> bool {
    true
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_dimensions() -> Vec<String> {
    vec!["user".to_string()]
}

fn default_max_sample_bytes() -> usize {
    64 * 1024
}

fn default_per_token() -> u64 {
    4
}

fn default_workers() -> usize {
    5
}

fn default_queue_size() -> usize {
    1000
}

fn default_flush_interval() -> u64 {
    15
}
