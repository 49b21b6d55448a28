//! Token bucket rate limiting.

mod bucket;
mod limiter;
mod rules;

pub use bucket::{apply_request, BucketKey, BucketTransition, RateLimitBucket};
pub use limiter::{FailureMode, LimiterSettings, RateLimitDecision, RateLimiter};
pub use rules::{normalize_operation, PolicyRule, PolicySet, RateLimitPolicy};
