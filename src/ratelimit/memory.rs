use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{LimitsConfig, RateLimitingConfig};

use super::{
    CounterKey, Decision, Denial, Dimension, RateLimiter, RequestSubjects, Reservation,
    ReservedEntry, Window,
};

/// In-process fixed-window limiter. All keys for a request are checked and
/// applied under one lock, so a deny never leaves partial increments and
/// reserve/commit/release are linearizable per key.
pub struct MemoryRateLimiter {
    dimensions: Vec<Dimension>,
    limits: LimitsConfig,
    counters: Mutex<HashMap<CounterKey, WindowCounters>>,
}

#[derive(Clone, Copy, Debug, Default)]
struct WindowCounters {
    window_start: i64,
    requests_used: u64,
    tokens_used: u64,
    tokens_reserved: u64,
}

impl WindowCounters {
    /// Counters as of `window_start`; a stale bucket reads as empty.
    fn current(self, window_start: i64) -> Self {
        if self.window_start == window_start {
            self
        } else {
            Self {
                window_start,
                ..Self::default()
            }
        }
    }
}

impl MemoryRateLimiter {
    pub fn from_config(config: &RateLimitingConfig) -> Self {
        let mut dimensions: Vec<Dimension> = config
            .dimensions
            .iter()
            .filter_map(|name| {
                let dimension = Dimension::parse(name);
                if dimension.is_none() {
                    tracing::warn!(dimension = %name, "ignoring unknown rate-limit dimension");
                }
                dimension
            })
            .collect();
        if dimensions.is_empty() {
            dimensions.push(Dimension::User);
        }
        Self::new(dimensions, config.limits.clone())
    }

    pub fn new(dimensions: Vec<Dimension>, limits: LimitsConfig) -> Self {
        Self {
            dimensions,
            limits,
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn request_limit(&self, window: Window) -> Option<u64> {
        match window {
            Window::Minute => self.limits.requests_per_minute,
            Window::Day => self.limits.requests_per_day,
        }
    }

    fn token_limit(&self, window: Window) -> Option<u64> {
        match window {
            Window::Minute => self.limits.tokens_per_minute,
            Window::Day => self.limits.tokens_per_day,
        }
    }

    fn window_enabled(&self, window: Window) -> bool {
        self.request_limit(window).is_some() || self.token_limit(window).is_some()
    }

    fn keys_for(&self, subjects: &RequestSubjects) -> Vec<CounterKey> {
        let mut keys = Vec::new();
        for &dimension in &self.dimensions {
            let Some(identity) = subjects.identity_for(dimension) else {
                continue;
            };
            for window in Window::ALL {
                if self.window_enabled(window) {
                    keys.push(CounterKey {
                        dimension,
                        identity: identity.clone(),
                        window,
                    });
                }
            }
        }
        keys
    }

    pub(crate) fn reserve_at(
        &self,
        subjects: &RequestSubjects,
        estimated_tokens: u64,
        now: DateTime<Utc>,
    ) -> Decision {
        let keys = self.keys_for(subjects);
        if keys.is_empty() {
            return Decision::Allow(Reservation::default());
        }

        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let snapshots: Vec<WindowCounters> = keys
            .iter()
            .map(|key| {
                let window_start = key.window.start_of(now);
                counters
                    .get(key)
                    .copied()
                    .unwrap_or_default()
                    .current(window_start)
            })
            .collect();

        // Optimistic first request: a fresh identity (no tokens used or
        // reserved anywhere) is admitted even if the estimate alone would
        // blow the window. Request limits still apply below.
        let fresh_identity = snapshots
            .iter()
            .all(|counter| counter.tokens_used == 0 && counter.tokens_reserved == 0);

        for (key, counter) in keys.iter().zip(&snapshots) {
            if let Some(limit) = self.request_limit(key.window) {
                if counter.requests_used.saturating_add(1) > limit {
                    return Decision::Deny(denial(key, limit, limit.saturating_sub(counter.requests_used), now));
                }
            }
            if !fresh_identity {
                if let Some(limit) = self.token_limit(key.window) {
                    let projected = counter
                        .tokens_used
                        .saturating_add(counter.tokens_reserved)
                        .saturating_add(estimated_tokens);
                    if projected > limit {
                        let in_use = counter.tokens_used.saturating_add(counter.tokens_reserved);
                        return Decision::Deny(denial(key, limit, limit.saturating_sub(in_use), now));
                    }
                }
            }
        }

        let reserved_tokens = if fresh_identity { 0 } else { estimated_tokens };
        let mut entries = Vec::with_capacity(keys.len());
        for (key, snapshot) in keys.into_iter().zip(snapshots) {
            let entry = counters.entry(key.clone()).or_default();
            *entry = snapshot;
            entry.requests_used = entry.requests_used.saturating_add(1);
            entry.tokens_reserved = entry.tokens_reserved.saturating_add(reserved_tokens);
            entries.push(ReservedEntry {
                key,
                window_start: entry.window_start,
            });
        }

        Decision::Allow(Reservation {
            entries,
            tokens: reserved_tokens,
        })
    }

    fn settle(&self, reservation: Reservation, actual_input_tokens: Option<u64>) {
        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        for reserved in reservation.entries {
            let Some(entry) = counters.get_mut(&reserved.key) else {
                continue;
            };
            // A rolled-over window already forgot this reservation.
            if entry.window_start != reserved.window_start {
                continue;
            }
            entry.tokens_reserved = entry.tokens_reserved.saturating_sub(reservation.tokens);
            if let Some(actual) = actual_input_tokens {
                entry.tokens_used = entry.tokens_used.saturating_add(actual);
            }
        }
    }
}

fn denial(key: &CounterKey, limit: u64, remaining: u64, now: DateTime<Utc>) -> Denial {
    let reset_epoch = key.window.end_of(now);
    Denial {
        reason: format!("{}:{}", key.dimension.label(), key.window.label()),
        limit,
        remaining,
        retry_after_secs: (reset_epoch - now.timestamp()).max(0) as u64,
        reset_epoch,
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn reserve(&self, subjects: &RequestSubjects, estimated_tokens: u64) -> Decision {
        self.reserve_at(subjects, estimated_tokens, Utc::now())
    }

    async fn commit(&self, reservation: Reservation, actual_input_tokens: u64) {
        self.settle(reservation, Some(actual_input_tokens));
    }

    async fn release(&self, reservation: Reservation) {
        self.settle(reservation, None);
    }
}
