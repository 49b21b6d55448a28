//! Core rate limiter implementation.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use super::bucket::{BucketKey, BucketTransition};
use super::rules::{normalize_operation, PolicySet, RateLimitPolicy};
use crate::abuse::{AbuseMetricsRecorder, EventMetadata, MetricType};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::BucketStore;

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Whole tokens left after this request
    pub remaining_tokens: u32,
    /// Seconds until the next whole token is available
    #[serde(rename = "resetAfterSeconds")]
    pub reset_after_secs: u64,
    /// Seconds the caller should wait before retrying (denials only)
    #[serde(rename = "retryAfterSeconds", skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    /// An admitted request with the given bucket level remaining.
    pub fn allowed(tokens: f64, policy: &RateLimitPolicy) -> Self {
        let whole = tokens.max(0.0).floor();
        Self {
            allowed: true,
            remaining_tokens: whole.min(u32::MAX as f64) as u32,
            reset_after_secs: seconds_until(1.0 - tokens.max(0.0).fract(), policy.refill_rate()),
            retry_after_secs: None,
        }
    }

    /// A denied request that may retry after `retry_after_secs`.
    pub fn denied(retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            remaining_tokens: 0,
            reset_after_secs: retry_after_secs,
            retry_after_secs: Some(retry_after_secs),
        }
    }

    /// An unchecked admission used when storage cannot be consulted.
    pub fn fail_open() -> Self {
        Self {
            allowed: true,
            remaining_tokens: 0,
            reset_after_secs: 0,
            retry_after_secs: None,
        }
    }
}

/// Seconds (rounded up) for `tokens` to regenerate at `rate` tokens/second.
fn seconds_until(tokens: f64, rate: f64) -> u64 {
    if tokens <= 0.0 {
        return 0;
    }
    let secs = (tokens / rate).ceil();
    if secs.is_finite() {
        secs as u64
    } else {
        u64::MAX
    }
}

/// What the limiter does when the bucket store cannot be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Admit the request with zero remaining tokens
    #[default]
    Open,
    /// Deny the request with a fixed retry-after
    Closed,
}

/// Limiter behavior outside the token arithmetic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Retry-after returned when failing closed
    #[serde(default = "default_fail_closed_retry_after")]
    pub fail_closed_retry_after_secs: u64,

    /// Retry-after returned when a request loses two update races in a row
    #[serde(default = "default_conflict_retry_after")]
    pub conflict_retry_after_secs: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::default(),
            fail_closed_retry_after_secs: default_fail_closed_retry_after(),
            conflict_retry_after_secs: default_conflict_retry_after(),
        }
    }
}

fn default_fail_closed_retry_after() -> u64 {
    5
}

fn default_conflict_retry_after() -> u64 {
    1
}

/// Token bucket rate limiter over a shared bucket store.
///
/// Holds no per-key state of its own; concurrent requests for the same key
/// are serialized by the store.
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    recorder: AbuseMetricsRecorder,
    clock: Arc<dyn Clock>,
    policies: RwLock<PolicySet>,
    settings: LimiterSettings,
}

impl RateLimiter {
    /// Create a rate limiter with default policies and settings.
    pub fn new(
        store: Arc<dyn BucketStore>,
        recorder: AbuseMetricsRecorder,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            recorder,
            clock,
            policies: RwLock::new(PolicySet::new()),
            settings: LimiterSettings::default(),
        }
    }

    /// Use the given policy table.
    pub fn with_policies(self, policies: PolicySet) -> Self {
        *self.policies.write() = policies;
        self
    }

    /// Use the given failure and conflict settings.
    pub fn with_settings(mut self, settings: LimiterSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the policy table.
    pub fn set_policies(&self, policies: PolicySet) {
        let mut current = self.policies.write();
        *current = policies;
    }

    /// Resolve the policy for an operation.
    pub fn policy_for(&self, operation: &str) -> RateLimitPolicy {
        self.policies.read().policy_for(operation)
    }

    /// Check and consume against the configured policy for `operation`.
    pub async fn check(&self, identifier: &str, operation: &str) -> RateLimitDecision {
        let policy = self.policy_for(operation);
        self.check_limit(identifier, &policy).await
    }

    /// Check the rate limit for an identifier under an explicit policy.
    ///
    /// Never returns an error: storage failures resolve through the
    /// configured failure mode, and a request that loses the update race
    /// twice is denied with a short retry-after.
    pub async fn check_limit(&self, identifier: &str, policy: &RateLimitPolicy) -> RateLimitDecision {
        let key = BucketKey::new(identifier, normalize_operation(&policy.operation));

        if let Err(e) = policy.validate() {
            error!(key = %key, error = %e, "Invalid rate limit policy");
            return self.on_unusable_store(&key);
        }

        trace!(
            key = %key,
            capacity = policy.capacity,
            refill_per_minute = policy.refill_per_minute,
            "Checking rate limit"
        );

        let mut retried = false;
        let transition = loop {
            let now = self.clock.now();
            match self.store.refill_and_consume(&key, policy, now).await {
                Ok(transition) => break transition,
                Err(StoreError::Conflict(_)) if !retried => {
                    debug!(key = %key, "Bucket update conflict, retrying once");
                    retried = true;
                }
                Err(StoreError::Conflict(_)) => {
                    warn!(key = %key, "Bucket update conflict after retry, denying");
                    let retry_after = self.settings.conflict_retry_after_secs;
                    self.recorder.record_detached(
                        MetricType::UpdateConflict,
                        identifier,
                        &key.operation,
                        EventMetadata::new().with("retry_after_secs", retry_after),
                    );
                    return RateLimitDecision::denied(retry_after);
                }
                Err(e) => {
                    error!(key = %key, error = %e, "Bucket store unavailable");
                    return self.on_unusable_store(&key);
                }
            }
        };

        match transition {
            BucketTransition::Created { tokens } => {
                debug!(key = %key, tokens = tokens, "Created bucket");
                RateLimitDecision::allowed(tokens, policy)
            }
            BucketTransition::Consumed { tokens } => RateLimitDecision::allowed(tokens, policy),
            BucketTransition::Denied { tokens_available } => {
                let retry_after = seconds_until(1.0 - tokens_available, policy.refill_rate());
                debug!(
                    key = %key,
                    tokens_available = tokens_available,
                    retry_after = retry_after,
                    "Rate limit exceeded"
                );

                let metadata = EventMetadata::new()
                    .with("tokens_available", tokens_available)
                    .with("tokens_needed", 1i64)
                    .with("capacity", policy.capacity)
                    .with("retry_after_secs", retry_after);
                self.recorder.record_detached(
                    MetricType::RateLimitExceeded,
                    identifier,
                    &key.operation,
                    metadata,
                );

                RateLimitDecision::denied(retry_after)
            }
        }
    }

    fn on_unusable_store(&self, key: &BucketKey) -> RateLimitDecision {
        match self.settings.failure_mode {
            FailureMode::Open => {
                warn!(key = %key, "Failing open");
                RateLimitDecision::fail_open()
            }
            FailureMode::Closed => {
                warn!(key = %key, "Failing closed");
                RateLimitDecision::denied(self.settings.fail_closed_retry_after_secs)
            }
        }
    }
}
