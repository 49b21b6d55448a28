//! Challenge escalation over aggregated abuse metrics.
//!
//! The decision is derived from a rolling-window count on every call and is
//! never persisted. A background monitor may cache the global answer in an
//! atomic flag for the request path to read cheaply.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::event::{MetricQuery, MetricType};
use crate::clock::Clock;
use crate::store::AbuseMetricsStore;

/// Longest accepted escalation window, one year.
pub const MAX_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

/// Which callers an escalation decision applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "identifier", rename_all = "snake_case")]
pub enum ChallengeScope {
    /// Every caller
    Global,
    /// A single caller identifier
    Identifier(String),
}

impl ChallengeScope {
    pub fn identifier(id: impl Into<String>) -> Self {
        ChallengeScope::Identifier(id.into())
    }
}

impl std::fmt::Display for ChallengeScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChallengeScope::Global => f.write_str("global"),
            ChallengeScope::Identifier(id) => write!(f, "identifier:{}", id),
        }
    }
}

/// Thresholds and window for escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationSettings {
    /// Metric counted toward escalation
    #[serde(default = "default_metric_type")]
    pub metric_type: MetricType,

    /// Trailing window in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Events across all callers that trigger a global challenge
    #[serde(default = "default_global_threshold")]
    pub global_threshold: u64,

    /// Events from one caller that trigger a challenge for that caller
    #[serde(default = "default_identifier_threshold")]
    pub identifier_threshold: u64,

    /// How often the background monitor re-evaluates the global scope
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            metric_type: default_metric_type(),
            window_secs: default_window_secs(),
            global_threshold: default_global_threshold(),
            identifier_threshold: default_identifier_threshold(),
            monitor_interval_secs: default_monitor_interval_secs(),
        }
    }
}

fn default_metric_type() -> MetricType {
    MetricType::RateLimitExceeded
}

fn default_window_secs() -> u64 {
    600
}

fn default_global_threshold() -> u64 {
    100
}

fn default_identifier_threshold() -> u64 {
    10
}

fn default_monitor_interval_secs() -> u64 {
    30
}

impl EscalationSettings {
    /// The threshold that applies to a scope.
    pub fn threshold_for(&self, scope: &ChallengeScope) -> u64 {
        match scope {
            ChallengeScope::Global => self.global_threshold,
            ChallengeScope::Identifier(_) => self.identifier_threshold,
        }
    }
}

/// A point-in-time escalation evaluation, for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationState {
    pub scope: ChallengeScope,
    pub challenge_required: bool,
    pub event_count: u64,
    pub threshold: u64,
    pub window_secs: u64,
    pub evaluated_at: DateTime<Utc>,
    /// Set when the metrics could not be read and the answer defaulted to false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decides whether a human-verification challenge must be required.
pub struct EscalationPolicy {
    metrics: Arc<dyn AbuseMetricsStore>,
    clock: Arc<dyn Clock>,
    settings: EscalationSettings,
    global_flag: AtomicBool,
}

impl EscalationPolicy {
    /// Create a policy over a metrics store.
    pub fn new(
        metrics: Arc<dyn AbuseMetricsStore>,
        clock: Arc<dyn Clock>,
        settings: EscalationSettings,
    ) -> Self {
        Self {
            metrics,
            clock,
            settings,
            global_flag: AtomicBool::new(false),
        }
    }

    /// The thresholds and window this policy evaluates with.
    pub fn settings(&self) -> &EscalationSettings {
        &self.settings
    }

    /// Count events in the trailing window and compare against the threshold.
    ///
    /// Never fails: a metrics read error yields `challenge_required = false`
    /// with the error attached.
    pub async fn evaluate(&self, scope: &ChallengeScope) -> EscalationState {
        let now = self.clock.now();
        let since = ChronoDuration::try_seconds(
            i64::try_from(self.settings.window_secs).unwrap_or(i64::MAX),
        )
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let query = MetricQuery {
            metric_type: self.settings.metric_type,
            since,
            identifier: match scope {
                ChallengeScope::Global => None,
                ChallengeScope::Identifier(id) => Some(id.clone()),
            },
        };
        let threshold = self.settings.threshold_for(scope);

        let (event_count, error) = match self.metrics.count(&query).await {
            Ok(count) => (count, None),
            Err(e) => {
                warn!(scope = %scope, error = %e, "Escalation read failed, not requiring challenge");
                (0, Some(e.to_string()))
            }
        };

        let challenge_required = event_count > 0 && event_count >= threshold;
        debug!(
            scope = %scope,
            event_count = event_count,
            threshold = threshold,
            challenge_required = challenge_required,
            "Evaluated escalation"
        );

        EscalationState {
            scope: scope.clone(),
            challenge_required,
            event_count,
            threshold,
            window_secs: self.settings.window_secs,
            evaluated_at: now,
            error,
        }
    }

    /// Whether a challenge is currently required for `scope`.
    pub async fn should_require_challenge(&self, scope: &ChallengeScope) -> bool {
        self.evaluate(scope).await.challenge_required
    }

    /// The last global decision published by the monitor.
    pub fn global_challenge_flag(&self) -> bool {
        self.global_flag.load(Ordering::Acquire)
    }

    /// Re-evaluate the global scope and publish the result.
    pub async fn refresh_global_flag(&self) -> EscalationState {
        let state = self.evaluate(&ChallengeScope::Global).await;
        let previous = self
            .global_flag
            .swap(state.challenge_required, Ordering::AcqRel);
        if previous != state.challenge_required {
            info!(
                challenge_required = state.challenge_required,
                event_count = state.event_count,
                threshold = state.threshold,
                "Global challenge requirement changed"
            );
        }
        state
    }

    /// Periodically refresh the global flag until `shutdown` fires.
    pub fn spawn_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let every = Duration::from_secs(self.settings.monitor_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticks = IntervalStream::new(tokio::time::interval(every));
            info!(interval_secs = every.as_secs(), "Escalation monitor started");
            loop {
                tokio::select! {
                    tick = ticks.next() => {
                        if tick.is_none() {
                            break;
                        }
                        self.refresh_global_flag().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("Escalation monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abuse::{AbuseMetricEvent, EventMetadata};
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn settings() -> EscalationSettings {
        EscalationSettings {
            window_secs: 300,
            global_threshold: 3,
            identifier_threshold: 2,
            ..Default::default()
        }
    }

    async fn seed(store: &MemoryStore, identifier: &str, at: DateTime<Utc>) {
        let event = AbuseMetricEvent::new(
            MetricType::RateLimitExceeded,
            identifier,
            "submit_form",
            EventMetadata::new(),
            at,
        );
        crate::store::AbuseMetricsStore::append(store, &event)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_events_means_no_challenge() {
        let store = Arc::new(MemoryStore::new());
        let policy = EscalationPolicy::new(store, Arc::new(ManualClock::default()), settings());

        assert!(!policy.should_require_challenge(&ChallengeScope::Global).await);
        assert!(
            !policy
                .should_require_challenge(&ChallengeScope::identifier("10.0.0.1"))
                .await
        );
    }

    #[tokio::test]
    async fn test_global_threshold() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let policy = EscalationPolicy::new(store.clone(), clock.clone(), settings());

        seed(&store, "a", clock.now()).await;
        seed(&store, "b", clock.now()).await;
        assert!(!policy.should_require_challenge(&ChallengeScope::Global).await);

        seed(&store, "c", clock.now()).await;
        let state = policy.evaluate(&ChallengeScope::Global).await;
        assert!(state.challenge_required);
        assert_eq!(state.event_count, 3);
        assert_eq!(state.threshold, 3);
    }

    #[tokio::test]
    async fn test_identifier_scope() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let policy = EscalationPolicy::new(store.clone(), clock.clone(), settings());

        seed(&store, "a", clock.now()).await;
        seed(&store, "a", clock.now()).await;
        seed(&store, "b", clock.now()).await;

        assert!(policy.should_require_challenge(&ChallengeScope::identifier("a")).await);
        assert!(!policy.should_require_challenge(&ChallengeScope::identifier("b")).await);
    }

    #[tokio::test]
    async fn test_window_expires_old_events() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let policy = EscalationPolicy::new(store.clone(), clock.clone(), settings());

        for id in ["a", "b", "c"] {
            seed(&store, id, clock.now()).await;
        }
        assert!(policy.should_require_challenge(&ChallengeScope::Global).await);

        clock.advance(ChronoDuration::seconds(301));
        assert!(!policy.should_require_challenge(&ChallengeScope::Global).await);
    }

    #[tokio::test]
    async fn test_repeated_reads_agree() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let policy = EscalationPolicy::new(store.clone(), clock.clone(), settings());

        for id in ["a", "b", "c", "d"] {
            seed(&store, id, clock.now()).await;
        }

        let first = policy.should_require_challenge(&ChallengeScope::Global).await;
        let second = policy.should_require_challenge(&ChallengeScope::Global).await;
        assert_eq!(first, second);
        assert_eq!(store.events().len(), 4);
    }

    #[tokio::test]
    async fn test_oversized_window_counts_everything() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let policy = EscalationPolicy::new(
            store.clone(),
            clock.clone(),
            EscalationSettings {
                window_secs: 10_000_000_000_000_000,
                ..settings()
            },
        );

        for id in ["a", "b", "c"] {
            seed(&store, id, clock.now()).await;
        }
        clock.advance(ChronoDuration::days(3650));

        let state = policy.evaluate(&ChallengeScope::Global).await;
        assert!(state.challenge_required);
        assert_eq!(state.event_count, 3);
        assert!(
            !policy
                .should_require_challenge(&ChallengeScope::identifier("a"))
                .await
        );
    }

    #[tokio::test]
    async fn test_store_outage_is_advisory() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let policy = EscalationPolicy::new(store.clone(), clock.clone(), settings());

        for id in ["a", "b", "c"] {
            seed(&store, id, clock.now()).await;
        }
        store.simulate_outage(true);

        let state = policy.evaluate(&ChallengeScope::Global).await;
        assert!(!state.challenge_required);
        assert!(state.error.is_some());
    }

    #[tokio::test]
    async fn test_refresh_publishes_global_flag() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let policy = EscalationPolicy::new(store.clone(), clock.clone(), settings());

        assert!(!policy.global_challenge_flag());
        for id in ["a", "b", "c"] {
            seed(&store, id, clock.now()).await;
        }
        policy.refresh_global_flag().await;
        assert!(policy.global_challenge_flag());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let policy = Arc::new(EscalationPolicy::new(store.clone(), clock.clone(), settings()));

        for id in ["a", "b", "c"] {
            seed(&store, id, clock.now()).await;
        }

        let (tx, rx) = watch::channel(false);
        let handle = Arc::clone(&policy).spawn_monitor(rx);

        // The first interval tick fires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(policy.global_challenge_flag());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor should stop")
            .unwrap();
    }

    #[test]
    fn test_scope_serialization() {
        let json = serde_json::to_value(ChallengeScope::identifier("192.0.2.1")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "identifier", "identifier": "192.0.2.1"})
        );
        let json = serde_json::to_value(ChallengeScope::Global).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "global"}));
    }
}
