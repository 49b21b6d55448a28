//! In-process store for single-instance deployments and tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::trace;

use super::{AbuseMetricsStore, BucketStore};
use crate::abuse::{AbuseMetricEvent, MetricQuery};
use crate::error::StoreError;
use crate::ratelimit::{apply_request, BucketKey, BucketTransition, RateLimitBucket, RateLimitPolicy};

/// In-memory bucket and metrics store.
///
/// Per-key atomicity comes from the map's shard lock: the whole
/// refill-and-consume runs while the entry is held, with no await inside.
///
/// Events are kept forever unless a retention is set with
/// [`MemoryStore::with_event_retention`]; the event log and `count` scans
/// grow with it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: DashMap<BucketKey, RateLimitBucket>,
    events: RwLock<Vec<AbuseMetricEvent>>,
    event_retention: Option<ChronoDuration>,
    outage: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop events older than `retention` relative to the newest append.
    pub fn with_event_retention(mut self, retention: Duration) -> Self {
        self.event_retention = ChronoDuration::from_std(retention).ok();
        self
    }

    /// Make every operation fail with `StoreError::Unavailable` until cleared.
    pub fn simulate_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// Snapshot of all recorded events, oldest first.
    pub fn events(&self) -> Vec<AbuseMetricEvent> {
        self.events.read().clone()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn refill_and_consume(
        &self,
        key: &BucketKey,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<BucketTransition, StoreError> {
        self.ensure_available()?;

        let transition = match self.buckets.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let (bucket, transition) =
                    apply_request(Some(entry.get().clone()), key, policy, now);
                entry.insert(bucket);
                transition
            }
            Entry::Vacant(entry) => {
                let (bucket, transition) = apply_request(None, key, policy, now);
                entry.insert(bucket);
                transition
            }
        };

        trace!(key = %key, transition = ?transition, "Applied bucket transition");
        Ok(transition)
    }

    async fn get(&self, key: &BucketKey) -> Result<Option<RateLimitBucket>, StoreError> {
        self.ensure_available()?;
        Ok(self.buckets.get(key).map(|b| b.value().clone()))
    }

    async fn delete_idle_since(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.ensure_available()?;

        let mut removed = 0u64;
        self.buckets.retain(|_, bucket| {
            let keep = bucket.last_request_at >= cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }

    async fn bucket_count(&self) -> Result<u64, StoreError> {
        self.ensure_available()?;
        Ok(self.buckets.len() as u64)
    }
}

#[async_trait]
impl AbuseMetricsStore for MemoryStore {
    async fn append(&self, event: &AbuseMetricEvent) -> Result<(), StoreError> {
        self.ensure_available()?;

        let mut events = self.events.write();
        if let Some(cutoff) = self
            .event_retention
            .and_then(|retention| event.created_at.checked_sub_signed(retention))
        {
            // Only the expired prefix is dropped; late stragglers go on a later append
            let expired = events.iter().take_while(|e| e.created_at < cutoff).count();
            if expired > 0 {
                events.drain(..expired);
                trace!(expired = expired, "Pruned expired abuse metrics");
            }
        }
        events.push(event.clone());
        Ok(())
    }

    async fn count(&self, query: &MetricQuery) -> Result<u64, StoreError> {
        self.ensure_available()?;

        let events = self.events.read();
        let count = events
            .iter()
            .filter(|e| e.metric_type == query.metric_type)
            .filter(|e| e.created_at >= query.since)
            .filter(|e| match &query.identifier {
                Some(identifier) => &e.identifier == identifier,
                None => true,
            })
            .count();
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abuse::{EventMetadata, MetricType};
    use chrono::Duration;

    fn policy() -> RateLimitPolicy {
        RateLimitPolicy::new("submit_form", 2, 60.0)
    }

    #[tokio::test]
    async fn test_creates_bucket_on_first_request() {
        let store = MemoryStore::new();
        let key = BucketKey::new("10.0.0.1", "submit_form");
        let now = Utc::now();

        let transition = store.refill_and_consume(&key, &policy(), now).await.unwrap();
        assert_eq!(transition, BucketTransition::Created { tokens: 1.0 });

        let bucket = store.get(&key).await.unwrap().unwrap();
        assert_eq!(bucket.request_count, 1);
        assert_eq!(store.bucket_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exhausts_bucket() {
        let store = MemoryStore::new();
        let key = BucketKey::new("10.0.0.1", "submit_form");
        let now = Utc::now();

        store.refill_and_consume(&key, &policy(), now).await.unwrap();
        let second = store.refill_and_consume(&key, &policy(), now).await.unwrap();
        assert_eq!(second, BucketTransition::Consumed { tokens: 0.0 });

        let third = store.refill_and_consume(&key, &policy(), now).await.unwrap();
        assert!(!third.is_allowed());
    }

    #[tokio::test]
    async fn test_event_retention_prunes_old_events() {
        let store = MemoryStore::new().with_event_retention(std::time::Duration::from_secs(600));
        let now = Utc::now();
        let event_at = |age_minutes: i64| {
            AbuseMetricEvent::new(
                MetricType::RateLimitExceeded,
                "a",
                "submit_form",
                EventMetadata::new(),
                now - Duration::minutes(age_minutes),
            )
        };

        for age_minutes in [30, 25, 22] {
            store.append(&event_at(age_minutes)).await.unwrap();
        }
        assert_eq!(store.events().len(), 3);

        store.append(&event_at(15)).await.unwrap();
        assert_eq!(store.events().len(), 3);

        store.append(&event_at(0)).await.unwrap();
        let kept = store.events();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].created_at, now);
    }

    #[tokio::test]
    async fn test_delete_idle_since() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let old = BucketKey::new("10.0.0.1", "submit_form");
        let fresh = BucketKey::new("10.0.0.2", "submit_form");

        store
            .refill_and_consume(&old, &policy(), now - Duration::hours(30))
            .await
            .unwrap();
        store.refill_and_consume(&fresh, &policy(), now).await.unwrap();

        let removed = store
            .delete_idle_since(now - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&old).await.unwrap().is_none());
        assert!(store.get(&fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_count_filters_by_type_window_and_identifier() {
        let store = MemoryStore::new();
        let now = Utc::now();

        for (identifier, age_minutes, metric_type) in [
            ("a", 1, MetricType::RateLimitExceeded),
            ("a", 2, MetricType::RateLimitExceeded),
            ("b", 3, MetricType::RateLimitExceeded),
            ("a", 30, MetricType::RateLimitExceeded),
            ("a", 1, MetricType::UpdateConflict),
        ] {
            let event = AbuseMetricEvent::new(
                metric_type,
                identifier,
                "submit_form",
                EventMetadata::new(),
                now - Duration::minutes(age_minutes),
            );
            store.append(&event).await.unwrap();
        }

        let mut query = MetricQuery {
            metric_type: MetricType::RateLimitExceeded,
            since: now - Duration::minutes(10),
            identifier: None,
        };
        assert_eq!(store.count(&query).await.unwrap(), 3);

        query.identifier = Some("a".to_string());
        assert_eq!(store.count(&query).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_simulated_outage() {
        let store = MemoryStore::new();
        let key = BucketKey::new("10.0.0.1", "submit_form");

        store.simulate_outage(true);
        let err = store
            .refill_and_consume(&key, &policy(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        store.simulate_outage(false);
        assert!(store.refill_and_consume(&key, &policy(), Utc::now()).await.is_ok());
    }
}
