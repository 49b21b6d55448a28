//! Token bucket state and the refill-and-consume transition.
//!
//! The transition here is pure: storage backends call it while holding
//! whatever per-key exclusion they provide, so the arithmetic lives in one
//! place and every backend applies it identically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rules::RateLimitPolicy;

/// A key that uniquely identifies a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    /// Caller identifier (usually a client address)
    pub identifier: String,
    /// The protected operation name
    pub operation: String,
}

impl BucketKey {
    /// Create a new bucket key.
    pub fn new(identifier: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            operation: operation.into(),
        }
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.operation, self.identifier)
    }
}

/// One persisted token bucket per (identifier, operation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub identifier: String,
    pub operation: String,
    /// Current fill level, `0 <= tokens <= capacity`
    pub tokens: f64,
    /// Last time `tokens` was recalculated
    pub last_refill_at: DateTime<Utc>,
    /// Lifetime count of admitted requests
    pub request_count: u64,
    /// Last observed request, used for staleness
    pub last_request_at: DateTime<Utc>,
}

/// What a single refill-and-consume step did to a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BucketTransition {
    /// The bucket did not exist and was created by this request.
    Created {
        /// Tokens left after the creating request consumed one
        tokens: f64,
    },
    /// A token was consumed from an existing bucket.
    Consumed {
        /// Tokens left after consumption
        tokens: f64,
    },
    /// Fewer than one token was available after refill.
    Denied {
        /// The refilled level the request was judged against
        tokens_available: f64,
    },
}

impl BucketTransition {
    /// Whether the request was admitted.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, BucketTransition::Denied { .. })
    }
}

impl RateLimitBucket {
    /// Create a bucket for the first request on a key.
    ///
    /// The creating request consumes one token immediately.
    pub fn create(key: &BucketKey, policy: &RateLimitPolicy, now: DateTime<Utc>) -> Self {
        Self {
            identifier: key.identifier.clone(),
            operation: key.operation.clone(),
            tokens: (policy.capacity as f64 - 1.0).max(0.0),
            last_refill_at: now,
            request_count: 1,
            last_request_at: now,
        }
    }

    /// The key this bucket is stored under.
    pub fn key(&self) -> BucketKey {
        BucketKey::new(self.identifier.clone(), self.operation.clone())
    }

    /// Tokens available at `now`, without mutating the bucket.
    ///
    /// A clock that reads earlier than `last_refill_at` contributes no refill.
    pub fn refilled_tokens(&self, policy: &RateLimitPolicy, now: DateTime<Utc>) -> f64 {
        let elapsed_us = (now - self.last_refill_at)
            .num_microseconds()
            .unwrap_or(i64::MAX)
            .max(0);
        let elapsed = elapsed_us as f64 / 1_000_000.0;
        let capacity = policy.capacity as f64;
        (self.tokens + elapsed * policy.refill_rate()).min(capacity)
    }

    /// Refill from elapsed time and try to consume one token.
    ///
    /// On denial the stored level and refill timestamp are left untouched;
    /// recomputing from them later yields the same refill, so nothing is lost.
    pub fn refill_and_consume(
        &mut self,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> BucketTransition {
        let candidate = self.refilled_tokens(policy, now);

        if now > self.last_request_at {
            self.last_request_at = now;
        }

        if candidate >= 1.0 {
            self.tokens = candidate - 1.0;
            if now > self.last_refill_at {
                self.last_refill_at = now;
            }
            self.request_count = self.request_count.saturating_add(1);
            BucketTransition::Consumed {
                tokens: self.tokens,
            }
        } else {
            BucketTransition::Denied {
                tokens_available: candidate,
            }
        }
    }
}

/// Apply one request to an optional existing bucket.
///
/// Returns the bucket to persist alongside what happened. Backends call
/// this inside their per-key critical section.
pub fn apply_request(
    existing: Option<RateLimitBucket>,
    key: &BucketKey,
    policy: &RateLimitPolicy,
    now: DateTime<Utc>,
) -> (RateLimitBucket, BucketTransition) {
    match existing {
        Some(mut bucket) => {
            let transition = bucket.refill_and_consume(policy, now);
            (bucket, transition)
        }
        None => {
            let bucket = RateLimitBucket::create(key, policy, now);
            let transition = BucketTransition::Created {
                tokens: bucket.tokens,
            };
            (bucket, transition)
        }
    }
}
