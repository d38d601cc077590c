pub mod capture;
pub mod config;
pub mod cost;
mod error;
pub mod identity;
pub mod keys;
pub mod pipeline;
pub mod providers;
pub mod proxy;
pub mod ratelimit;
pub mod server;

pub use config::ProxyConfig;
pub use cost::{CostTracker, Transport, UsageRecord};
pub use error::{ProxyError, Result};
pub use keys::{ApiKeyStore, ConfigKeyStore};
pub use providers::{Provider, ProviderRegistry, ResponseMetadata};
pub use ratelimit::{Decision, MemoryRateLimiter, RateLimiter};
pub use server::{ProxyState, build_router};

/// Version reported by `--version` and the `/health` endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Port used when `PORT` is not set.
pub const DEFAULT_PORT: u16 = 9002;
