#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use llm_proxy::cost::{CostTracker, PricingTable, Transport};
use llm_proxy::providers::{
    AnthropicProvider, GeminiProvider, GroqProvider, OpenAiProvider, ProviderRegistry,
};
use llm_proxy::{ProxyState, UsageRecord};

/// Registry where every adapter points at the same mock upstream.
pub fn registry_for(base_url: &str) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(OpenAiProvider::with_base_url(base_url)));
    registry.register(Arc::new(AnthropicProvider::with_base_url(base_url)));
    registry.register(Arc::new(GeminiProvider::with_base_url(base_url)));
    registry.register(Arc::new(GroqProvider::with_base_url(base_url)));
    registry
}

pub fn state_for(base_url: &str) -> ProxyState {
    ProxyState::new(registry_for(base_url)).expect("proxy state")
}

/// Transport that keeps every delivered record in memory for assertions.
pub struct RecordingTransport {
    pub records: Mutex<Vec<UsageRecord>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
        })
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, record: &UsageRecord) -> llm_proxy::Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

pub fn recording_tracker() -> (Arc<CostTracker>, Arc<RecordingTransport>) {
    recording_tracker_with_pricing(PricingTable::default())
}

pub fn recording_tracker_with_pricing(
    pricing: PricingTable,
) -> (Arc<CostTracker>, Arc<RecordingTransport>) {
    let transport = RecordingTransport::new();
    let tracker = Arc::new(CostTracker::new(vec![transport.clone()], pricing));
    (tracker, transport)
}
