//! Pre-request quotas: fixed-window counters with provisional token
//! reservations that are committed or refunded once actual usage is known.

mod memory;

pub use memory::MemoryRateLimiter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::EstimationConfig;

/// Quota window, aligned to wall-clock boundaries (minute of the hour, UTC
/// day). Rolling into a new window resets counters implicitly by keying.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Window {
    Minute,
    Day,
}

impl Window {
    pub const ALL: [Window; 2] = [Window::Minute, Window::Day];

    pub fn label(self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Day => "day",
        }
    }

    pub fn seconds(self) -> i64 {
        match self {
            Window::Minute => 60,
            Window::Day => 86_400,
        }
    }

    pub fn start_of(self, now: DateTime<Utc>) -> i64 {
        let secs = now.timestamp();
        secs - secs.rem_euclid(self.seconds())
    }

    pub fn end_of(self, now: DateTime<Utc>) -> i64 {
        self.start_of(now) + self.seconds()
    }
}

/// Quota dimension. Each enabled dimension contributes its own counter keys;
/// a request is denied if any key would exceed its limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dimension {
    User,
    ApiKey,
    Model,
    Provider,
    Global,
}

impl Dimension {
    pub fn label(self) -> &'static str {
        match self {
            Dimension::User => "user",
            Dimension::ApiKey => "api-key",
            Dimension::Model => "model",
            Dimension::Provider => "provider",
            Dimension::Global => "global",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "user" => Some(Dimension::User),
            "api-key" | "api_key" => Some(Dimension::ApiKey),
            "model" => Some(Dimension::Model),
            "provider" => Some(Dimension::Provider),
            "global" => Some(Dimension::Global),
            _ => None,
        }
    }
}

/// Identities a single request is counted under.
#[derive(Clone, Debug, Default)]
pub struct RequestSubjects {
    pub user_id: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub provider: String,
}

impl RequestSubjects {
    pub fn identity_for(&self, dimension: Dimension) -> Option<String> {
        match dimension {
            Dimension::User => {
                (!self.user_id.is_empty()).then(|| self.user_id.clone())
            }
            Dimension::ApiKey => self.api_key.clone(),
            Dimension::Model => self.model.clone(),
            Dimension::Provider => {
                (!self.provider.is_empty()).then(|| self.provider.clone())
            }
            Dimension::Global => Some("global".to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub dimension: Dimension,
    pub identity: String,
    pub window: Window,
}

/// Handle returned by a successful `reserve`. Exactly one of `commit` or
/// `release` must consume it.
#[derive(Debug, Default)]
pub struct Reservation {
    pub(crate) entries: Vec<ReservedEntry>,
    /// Tokens provisionally debited at admission; zero under the
    /// optimistic-first-request rule.
    pub(crate) tokens: u64,
}

#[derive(Debug)]
pub(crate) struct ReservedEntry {
    pub(crate) key: CounterKey,
    pub(crate) window_start: i64,
}

#[derive(Clone, Debug)]
pub struct Denial {
    /// `<dimension>:<window>`, e.g. `user:minute`.
    pub reason: String,
    pub limit: u64,
    pub remaining: u64,
    pub retry_after_secs: u64,
    pub reset_epoch: i64,
}

pub enum Decision {
    Allow(Reservation),
    Deny(Denial),
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Admission check. On `Allow` the returned reservation holds the
    /// provisional token debit; on `Deny` no counter was touched.
    async fn reserve(&self, subjects: &RequestSubjects, estimated_tokens: u64) -> Decision;

    /// Replaces the reservation with actual usage (input tokens only; output
    /// tokens are deliberately not metered against token windows).
    async fn commit(&self, reservation: Reservation, actual_input_tokens: u64);

    /// Refunds the reservation (upstream error, client abort, parse failure).
    async fn release(&self, reservation: Reservation);
}

/// Admission-time token estimate. Small text requests are estimated from the
/// message characters the adapter extracted; everything else falls back to
/// body size. Non-text modalities have no extractable text and land on the
/// byte heuristic too.
pub fn estimate_request_tokens(
    config: &EstimationConfig,
    provider_name: &str,
    body: &[u8],
    messages: &[String],
) -> u64 {
    if body.len() <= config.max_sample_bytes && !messages.is_empty() {
        let chars: u64 = messages
            .iter()
            .map(|message| message.chars().count() as u64)
            .sum();
        let chars_per_token = config
            .provider_chars_per_token
            .get(provider_name)
            .copied()
            .unwrap_or(config.chars_per_token)
            .max(1);
        return chars.div_ceil(chars_per_token);
    }

    (body.len() as u64).div_ceil(config.bytes_per_token.max(1))
}
