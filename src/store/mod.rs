//! Shared state backends.
//!
//! All coordination between replicas is pushed down to these stores: the
//! bucket store owns the per-key atomic refill-and-consume transition, and
//! the metrics store owns the append-only abuse log. Handles are passed in
//! explicitly so tests can swap in the in-memory backend.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::abuse::{AbuseMetricEvent, MetricQuery};
use crate::error::StoreError;
use crate::ratelimit::{BucketKey, BucketTransition, RateLimitBucket, RateLimitPolicy};

/// Durable storage for one token bucket per (identifier, operation).
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Atomically load or create the bucket for `key`, refill it to `now`
    /// and try to consume one token.
    ///
    /// Implementations must apply the whole read-modify-write or none of it,
    /// and must serialize concurrent calls for the same key.
    async fn refill_and_consume(
        &self,
        key: &BucketKey,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<BucketTransition, StoreError>;

    /// Read a bucket without modifying it.
    async fn get(&self, key: &BucketKey) -> Result<Option<RateLimitBucket>, StoreError>;

    /// Delete every bucket whose last request is older than `cutoff`.
    ///
    /// Returns the number of buckets removed.
    async fn delete_idle_since(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Number of buckets currently stored.
    async fn bucket_count(&self) -> Result<u64, StoreError>;
}

/// Append-only storage for abuse metric events.
#[async_trait]
pub trait AbuseMetricsStore: Send + Sync {
    /// Append one event.
    async fn append(&self, event: &AbuseMetricEvent) -> Result<(), StoreError>;

    /// Count events matching a rolling-window query.
    async fn count(&self, query: &MetricQuery) -> Result<u64, StoreError>;
}
