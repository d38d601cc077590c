//! Streaming response capture: duplicates the byte stream into a bounded
//! buffer and re-parses it on every chunk, so token totals are known the
//! moment the upstream emits them — including when the client aborts before
//! the stream finishes.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;

use crate::cost::{CostTracker, UsageRecord};
use crate::providers::{Provider, ResponseMetadata};
use crate::ratelimit::{RateLimiter, Reservation};

/// Parse-buffer cap. Past this the capture stops parsing and keeps the last
/// good metadata; the client keeps receiving bytes regardless.
const MAX_CAPTURE_BYTES: usize = 8 * 1024 * 1024;

pub struct StreamCapture {
    provider: Arc<dyn Provider>,
    buffer: BytesMut,
    last: Option<ResponseMetadata>,
    parse_enabled: bool,
}

impl StreamCapture {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            buffer: BytesMut::new(),
            last: None,
            parse_enabled: true,
        }
    }

    /// A capture that forwards bytes without ever parsing them (non-metered
    /// endpoints).
    pub fn disabled(provider: Arc<dyn Provider>) -> Self {
        Self {
            parse_enabled: false,
            ..Self::new(provider)
        }
    }

    /// Appends a chunk and re-parses the cumulative transcript. The parser
    /// is idempotent over growing prefixes, so the latest successful result
    /// is always the most complete one.
    pub fn ingest(&mut self, chunk: &[u8]) {
        if !self.parse_enabled {
            return;
        }
        if self.buffer.len().saturating_add(chunk.len()) > MAX_CAPTURE_BYTES {
            tracing::debug!("stream capture buffer full, keeping last parsed usage");
            self.parse_enabled = false;
            return;
        }
        self.buffer.extend_from_slice(chunk);

        match self.provider.parse_response_metadata(&self.buffer, true) {
            Ok(metadata) => self.last = Some(metadata),
            Err(err) => {
                tracing::trace!(error = %err, "partial stream not yet parseable");
            }
        }
    }

    pub fn latest(&self) -> Option<&ResponseMetadata> {
        self.last.as_ref()
    }
}

#[derive(Clone, Copy, Debug)]
pub enum StreamEnd {
    Completed,
    Error,
    Aborted,
}

/// Everything needed to settle a streaming request once, whichever way it
/// ends: commit-or-release the quota reservation and emit the usage record.
pub struct StreamFinalizer {
    pub limiter: Option<Arc<dyn RateLimiter>>,
    pub reservation: Option<Reservation>,
    pub tracker: Option<Arc<CostTracker>>,
    pub user_id: String,
    pub ip_address: String,
    pub request_path: String,
    pub model_hint: Option<String>,
}

impl StreamFinalizer {
    pub async fn finalize(mut self, metadata: Option<ResponseMetadata>, end: StreamEnd) {
        let reservation = self.reservation.take();

        match metadata.filter(ResponseMetadata::has_usage) {
            Some(mut metadata) => {
                if metadata.model.is_empty() {
                    if let Some(hint) = self.model_hint.take() {
                        metadata.model = hint;
                    }
                }

                if let (Some(limiter), Some(reservation)) = (self.limiter.as_ref(), reservation) {
                    limiter.commit(reservation, metadata.input_tokens).await;
                }

                tracing::info!(
                    provider = %metadata.provider,
                    model = %metadata.model,
                    input_tokens = metadata.input_tokens,
                    output_tokens = metadata.output_tokens,
                    total_tokens = metadata.total_tokens,
                    end = ?end,
                    "stream finished with usage"
                );

                if let Some(tracker) = self.tracker.as_ref() {
                    let record = UsageRecord::from_metadata(
                        &metadata,
                        self.user_id,
                        self.ip_address,
                        self.request_path,
                    );
                    tracker.track(record).await;
                }
            }
            None => {
                if let (Some(limiter), Some(reservation)) = (self.limiter.as_ref(), reservation) {
                    limiter.release(reservation).await;
                }
                tracing::debug!(end = ?end, "stream ended before usage was seen");
            }
        }
    }
}

struct CaptureStreamState {
    upstream: BoxStream<'static, std::io::Result<Bytes>>,
    capture: StreamCapture,
    finalizer: Option<StreamFinalizer>,
}

impl CaptureStreamState {
    async fn finalize(&mut self, end: StreamEnd) {
        if let Some(finalizer) = self.finalizer.take() {
            finalizer.finalize(self.capture.latest().cloned(), end).await;
        }
    }
}

impl Drop for CaptureStreamState {
    fn drop(&mut self) {
        // The stream was dropped before completion (client abort). Settle on
        // the runtime with the best metadata seen so far.
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        let metadata = self.capture.latest().cloned();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                finalizer.finalize(metadata, StreamEnd::Aborted).await;
            });
        }
    }
}

/// Wraps the upstream byte stream: every chunk goes to the client unchanged
/// and into the capture; the finalizer fires exactly once on completion,
/// error, or abort.
pub fn capture_stream(
    upstream: BoxStream<'static, std::io::Result<Bytes>>,
    capture: StreamCapture,
    finalizer: StreamFinalizer,
) -> impl futures_util::Stream<Item = std::io::Result<Bytes>> {
    let state = CaptureStreamState {
        upstream,
        capture,
        finalizer: Some(finalizer),
    };

    futures_util::stream::try_unfold(state, |mut state| async move {
        match state.upstream.next().await {
            Some(Ok(chunk)) => {
                state.capture.ingest(&chunk);
                Ok(Some((chunk, state)))
            }
            Some(Err(err)) => {
                state.finalize(StreamEnd::Error).await;
                Err(err)
            }
            None => {
                state.finalize(StreamEnd::Completed).await;
                Ok(None)
            }
        }
    })
}
