//! Usage metering: one record per tracked request, priced and fanned out to
//! the configured transports, synchronously or through a bounded queue.

mod pricing;
mod transport;

pub use pricing::{CostBreakdown, ModelPricing, PricingOverride, PricingTable, PricingTier};
pub use transport::{FileTransport, LogTransport, Transport, create_transport};

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::providers::ResponseMetadata;

/// Emitted exactly once per tracked completed request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub request_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub thought_tokens: u64,
    pub total_tokens: u64,
    pub finish_reason: String,
    pub is_streaming: bool,
    pub user_id: String,
    pub ip_address: String,
    pub request_path: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub cost_input: f64,
    pub cost_output: f64,
    pub cost_total: f64,
}

impl Default for UsageRecord {
    fn default() -> Self {
        Self {
            provider: String::new(),
            model: String::new(),
            request_id: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            thought_tokens: 0,
            total_tokens: 0,
            finish_reason: String::new(),
            is_streaming: false,
            user_id: String::new(),
            ip_address: String::new(),
            request_path: String::new(),
            timestamp: Utc::now(),
            cost_input: 0.0,
            cost_output: 0.0,
            cost_total: 0.0,
        }
    }
}

impl UsageRecord {
    pub fn from_metadata(
        metadata: &ResponseMetadata,
        user_id: String,
        ip_address: String,
        request_path: String,
    ) -> Self {
        Self {
            provider: metadata.provider.clone(),
            model: metadata.model.clone(),
            request_id: metadata.request_id.clone(),
            input_tokens: metadata.input_tokens,
            output_tokens: metadata.output_tokens,
            thought_tokens: metadata.thought_tokens,
            total_tokens: metadata.total_tokens,
            finish_reason: metadata.finish_reason.clone(),
            is_streaming: metadata.is_streaming,
            user_id,
            ip_address,
            request_path,
            timestamp: Utc::now(),
            cost_input: 0.0,
            cost_output: 0.0,
            cost_total: 0.0,
        }
    }
}

struct AsyncQueue {
    records: Mutex<VecDeque<UsageRecord>>,
    capacity: usize,
    notify: Notify,
    shutdown: watch::Sender<bool>,
}

/// Prices and delivers usage records. In synchronous mode `track` awaits
/// every transport; in asynchronous mode it enqueues (drop-oldest on a full
/// queue) and worker tasks drain on notification or a flush tick.
pub struct CostTracker {
    transports: Vec<Arc<dyn Transport>>,
    pricing: PricingTable,
    queue: Option<Arc<AsyncQueue>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CostTracker {
    pub fn new(transports: Vec<Arc<dyn Transport>>, pricing: PricingTable) -> Self {
        Self {
            transports,
            pricing,
            queue: None,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn is_async(&self) -> bool {
        self.queue.is_some()
    }

    /// Switches to asynchronous delivery. Must be called from within a tokio
    /// runtime; the workers live until `shutdown`.
    pub fn start_async_workers(
        &mut self,
        workers: usize,
        queue_size: usize,
        flush_interval: Duration,
    ) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = Arc::new(AsyncQueue {
            records: Mutex::new(VecDeque::new()),
            capacity: queue_size.max(1),
            notify: Notify::new(),
            shutdown: shutdown_tx,
        });

        let mut handles = Vec::with_capacity(workers.max(1));
        for _ in 0..workers.max(1) {
            let queue = queue.clone();
            let transports = self.transports.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    while let Some(record) = pop_record(&queue) {
                        deliver(&transports, &record).await;
                    }
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    tokio::select! {
                        _ = queue.notify.notified() => {}
                        _ = tokio::time::sleep(flush_interval) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }));
        }

        self.queue = Some(queue);
        *self.workers.lock().unwrap_or_else(|e| e.into_inner()) = handles;
    }

    /// Applies pricing and hands the record to the transports.
    pub async fn track(&self, mut record: UsageRecord) {
        if let Some(cost) = self.pricing.cost(
            &record.provider,
            &record.model,
            record.input_tokens,
            record.output_tokens,
        ) {
            record.cost_input = cost.input;
            record.cost_output = cost.output;
            record.cost_total = cost.total;
        }

        match self.queue.as_ref() {
            Some(queue) => {
                let mut records = queue.records.lock().unwrap_or_else(|e| e.into_inner());
                if records.len() >= queue.capacity {
                    records.pop_front();
                    tracing::warn!("usage queue full, dropping oldest record");
                }
                records.push_back(record);
                drop(records);
                queue.notify.notify_one();
            }
            None => deliver(&self.transports, &record).await,
        }
    }

    /// Drains the queue and stops the workers, bounded by `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        let Some(queue) = self.queue.as_ref() else {
            return;
        };
        let _ = queue.shutdown.send(true);

        let handles = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for handle in handles {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!("usage worker did not drain within the shutdown timeout");
            }
        }
    }
}

fn pop_record(queue: &AsyncQueue) -> Option<UsageRecord> {
    queue
        .records
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .pop_front()
}

async fn deliver(transports: &[Arc<dyn Transport>], record: &UsageRecord) {
    for transport in transports {
        if let Err(err) = transport.send(record).await {
            tracing::warn!(transport = transport.name(), error = %err, "failed to deliver usage record");
        }
    }
}
