//! Router assembly and shared state. Routes are registered centrally for
//! every provider in the registry; adapters only contribute extra routes.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{any, get};
use axum::{Json, Router};
use chrono::Utc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::EstimationConfig;
use crate::cost::CostTracker;
use crate::error::Result;
use crate::keys::ApiKeyStore;
use crate::pipeline::dispatch;
use crate::providers::ProviderRegistry;
use crate::proxy::Upstream;
use crate::ratelimit::RateLimiter;

const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_USAGE_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct ProxyState {
    pub registry: Arc<ProviderRegistry>,
    pub upstream: Arc<Upstream>,
    pub limiter: Option<Arc<dyn RateLimiter>>,
    pub estimation: Arc<EstimationConfig>,
    pub cost: Option<Arc<CostTracker>>,
    pub key_store: Option<Arc<dyn ApiKeyStore>>,
    /// Cap on buffered request bodies.
    pub max_body_bytes: usize,
    /// Unary responses above this size are forwarded without usage parsing.
    pub usage_max_body_bytes: usize,
}

impl ProxyState {
    pub fn new(registry: ProviderRegistry) -> Result<Self> {
        Ok(Self {
            registry: Arc::new(registry),
            upstream: Arc::new(Upstream::new()?),
            limiter: None,
            estimation: Arc::new(EstimationConfig::default()),
            cost: None,
            key_store: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            usage_max_body_bytes: DEFAULT_USAGE_MAX_BODY_BYTES,
        })
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_estimation(mut self, estimation: EstimationConfig) -> Self {
        self.estimation = Arc::new(estimation);
        self
    }

    pub fn with_cost_tracker(mut self, tracker: Arc<CostTracker>) -> Self {
        self.cost = Some(tracker);
        self
    }

    pub fn with_key_store(mut self, key_store: Arc<dyn ApiKeyStore>) -> Self {
        self.key_store = Some(key_store);
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes.max(1);
        self
    }

    pub fn with_usage_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.usage_max_body_bytes = max_body_bytes;
        self
    }
}

pub fn build_router(state: ProxyState) -> Router {
    let mut router = Router::new().route("/health", get(health));

    for provider in state.registry.iter() {
        router = router
            .route(&format!("/{}/*path", provider.name()), any(dispatch))
            .route(
                &format!("/meta/:user_id/{}/*path", provider.name()),
                any(dispatch),
            );
        router = provider.register_extra_routes(router);
        tracing::info!(provider = provider.name(), "registered provider routes");
    }

    router
        .fallback(dispatch)
        .layer(cors_layer())
        .with_state(state)
}

/// Permissive CORS: preflights short-circuit here and every response gets
/// the allow-* headers.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn health(State(state): State<ProxyState>) -> Json<serde_json::Value> {
    let providers: BTreeMap<&str, serde_json::Value> = state
        .registry
        .iter()
        .map(|provider| (provider.name(), provider.health_status()))
        .collect();

    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().timestamp(),
        "providers": providers,
        "features": {
            "cost_tracking": state.cost.is_some(),
        },
    }))
}
