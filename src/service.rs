//! The request-facing facade.
//!
//! Wires the resolver, limiter, recorder, escalation policy and janitor
//! from one configuration, and exposes the operator surface.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::abuse::{AbuseMetricsRecorder, ChallengeScope, EscalationPolicy, EscalationState};
use crate::clock::{Clock, SystemClock};
use crate::config::{FloodgateConfig, StoreBackend};
use crate::error::{Result, StoreError};
use crate::identity::{ClientIdentifierResolver, RequestHeaders};
use crate::janitor::BucketJanitor;
use crate::ratelimit::{RateLimitDecision, RateLimiter};
use crate::store::{AbuseMetricsStore, BucketStore, MemoryStore, SqliteStore};

/// A rate limit decision together with the caller it applied to and
/// whether a human-verification challenge should be shown.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDecision {
    #[serde(flatten)]
    pub decision: RateLimitDecision,
    pub identifier: String,
    pub operation: String,
    pub challenge_required: bool,
}

/// The assembled rate limiting and abuse escalation subsystem.
pub struct Floodgate {
    resolver: ClientIdentifierResolver,
    limiter: Arc<RateLimiter>,
    escalation: Arc<EscalationPolicy>,
    janitor: Arc<BucketJanitor>,
}

impl Floodgate {
    /// Build the subsystem, opening the configured store.
    pub fn from_config(config: &FloodgateConfig) -> Result<Self> {
        let (buckets, metrics): (Arc<dyn BucketStore>, Arc<dyn AbuseMetricsStore>) =
            match config.store.backend {
                StoreBackend::Memory => {
                    let store = Arc::new(MemoryStore::new().with_event_retention(
                        Duration::from_secs(config.escalation.window_secs),
                    ));
                    (store.clone(), store)
                }
                StoreBackend::Sqlite => {
                    let store = Arc::new(SqliteStore::open(
                        &config.store.path,
                        config.store.busy_timeout(),
                    )?);
                    (store.clone(), store)
                }
            };

        Self::with_stores(config, buckets, metrics, Arc::new(SystemClock))
    }

    /// Build the subsystem over explicit store handles and clock.
    pub fn with_stores(
        config: &FloodgateConfig,
        buckets: Arc<dyn BucketStore>,
        metrics: Arc<dyn AbuseMetricsStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let policies = config.load_policies()?;
        let min_sweep_age = policies.longest_refill_window();

        let recorder = AbuseMetricsRecorder::new(metrics.clone(), clock.clone())
            .with_timeout(config.metrics.record_timeout());
        let limiter = RateLimiter::new(buckets.clone(), recorder, clock.clone())
            .with_policies(policies)
            .with_settings(config.limiter.clone());
        let escalation = EscalationPolicy::new(metrics, clock.clone(), config.escalation.clone());
        let janitor = BucketJanitor::new(buckets, clock, config.janitor.clone())
            .with_min_age(min_sweep_age);

        info!(
            backend = ?config.store.backend,
            failure_mode = ?config.limiter.failure_mode,
            sweep_age_secs = janitor.effective_max_age().as_secs(),
            "Floodgate initialized"
        );

        Ok(Self {
            resolver: ClientIdentifierResolver::new(&config.resolver),
            limiter: Arc::new(limiter),
            escalation: Arc::new(escalation),
            janitor: Arc::new(janitor),
        })
    }

    /// The caller identifier resolver.
    pub fn resolver(&self) -> &ClientIdentifierResolver {
        &self.resolver
    }

    /// The rate limiter, for direct checks under an explicit policy.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// The escalation policy and its cached global flag.
    pub fn escalation(&self) -> &Arc<EscalationPolicy> {
        &self.escalation
    }

    /// The idle bucket janitor.
    pub fn janitor(&self) -> &Arc<BucketJanitor> {
        &self.janitor
    }

    /// Gate one inbound request for `operation`.
    ///
    /// A challenge is required when the global flag is raised, or when the
    /// request was denied and its caller crossed the per-identifier threshold.
    #[instrument(skip(self, headers), fields(operation = %operation))]
    pub async fn check_request(&self, headers: &RequestHeaders, operation: &str) -> GateDecision {
        let identifier = self.resolver.resolve(headers);
        let decision = self.limiter.check(&identifier, operation).await;

        let challenge_required = self.escalation.global_challenge_flag()
            || (!decision.allowed
                && self
                    .escalation
                    .should_require_challenge(&ChallengeScope::identifier(identifier.as_str()))
                    .await);

        debug!(
            identifier = %identifier,
            allowed = decision.allowed,
            challenge_required = challenge_required,
            "Gate decision made"
        );

        GateDecision {
            decision,
            identifier,
            operation: operation.to_string(),
            challenge_required,
        }
    }

    /// Whether a challenge is currently required for `scope`.
    pub async fn challenge_required(&self, scope: &ChallengeScope) -> bool {
        self.escalation.should_require_challenge(scope).await
    }

    /// Read-only escalation snapshot for operators.
    pub async fn escalation_state(&self, scope: &ChallengeScope) -> EscalationState {
        self.escalation.evaluate(scope).await
    }

    /// Run a sweep now with the configured age.
    pub async fn sweep_now(&self) -> std::result::Result<u64, StoreError> {
        self.janitor.sweep_stale().await
    }

    /// Run a sweep now with an explicit age.
    pub async fn sweep(&self, max_age_secs: u64) -> std::result::Result<u64, StoreError> {
        self.janitor.sweep(max_age_secs).await
    }

    /// Start the janitor and escalation monitor.
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            Arc::clone(&self.janitor).spawn(shutdown.clone()),
            Arc::clone(&self.escalation).spawn_monitor(shutdown),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abuse::EscalationSettings;
    use crate::clock::ManualClock;
    use crate::identity::UNKNOWN_IDENTIFIER;
    use crate::ratelimit::{PolicySet, RateLimitPolicy};

    fn config() -> FloodgateConfig {
        let mut policies = PolicySet::new();
        policies.insert(RateLimitPolicy::new("submit_form", 2, 1.0));
        FloodgateConfig {
            policies,
            escalation: EscalationSettings {
                global_threshold: 100,
                identifier_threshold: 2,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn gate(store: Arc<MemoryStore>) -> Floodgate {
        Floodgate::with_stores(
            &config(),
            store.clone(),
            store,
            Arc::new(ManualClock::default()),
        )
        .unwrap()
    }

    async fn wait_for_events(store: &MemoryStore, expected: usize) {
        for _ in 0..200 {
            if store.events().len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} events", expected);
    }

    fn headers(ip: &str) -> RequestHeaders {
        [("x-forwarded-for", ip)].into_iter().collect()
    }

    #[tokio::test]
    async fn test_request_without_headers_uses_shared_bucket() {
        let store = Arc::new(MemoryStore::new());
        let gate = gate(store);

        let first = gate.check_request(&RequestHeaders::new(), "submit_form").await;
        assert!(first.decision.allowed);
        assert_eq!(first.identifier, UNKNOWN_IDENTIFIER);

        gate.check_request(&RequestHeaders::new(), "submit_form").await;
        let third = gate.check_request(&RequestHeaders::new(), "submit_form").await;
        assert!(!third.decision.allowed);
        assert_eq!(third.decision.retry_after_secs, Some(60));
    }

    #[tokio::test]
    async fn test_repeat_offender_gets_challenged() {
        let store = Arc::new(MemoryStore::new());
        let gate = gate(store.clone());
        let h = headers("198.51.100.20");

        gate.check_request(&h, "submit_form").await;
        gate.check_request(&h, "submit_form").await;

        let denied = gate.check_request(&h, "submit_form").await;
        assert!(!denied.decision.allowed);
        wait_for_events(&store, 1).await;

        let denied = gate.check_request(&h, "submit_form").await;
        assert!(!denied.decision.allowed);
        wait_for_events(&store, 2).await;

        let denied = gate.check_request(&h, "submit_form").await;
        assert!(denied.challenge_required);

        // Another caller is unaffected
        let other = gate.check_request(&headers("198.51.100.21"), "submit_form").await;
        assert!(other.decision.allowed);
        assert!(!other.challenge_required);
    }

    #[tokio::test]
    async fn test_global_flag_applies_to_everyone() {
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config();
        cfg.escalation.global_threshold = 1;
        let gate = Floodgate::with_stores(
            &cfg,
            store.clone(),
            store.clone(),
            Arc::new(ManualClock::default()),
        )
        .unwrap();

        let h = headers("198.51.100.30");
        for _ in 0..3 {
            gate.check_request(&h, "submit_form").await;
        }
        wait_for_events(&store, 1).await;

        gate.escalation().refresh_global_flag().await;
        let fresh = gate.check_request(&headers("192.0.2.99"), "submit_form").await;
        assert!(fresh.decision.allowed);
        assert!(fresh.challenge_required);

        let state = gate.escalation_state(&ChallengeScope::Global).await;
        assert!(state.challenge_required);
        assert_eq!(state.event_count, 1);
    }

    #[tokio::test]
    async fn test_outage_fails_open_end_to_end() {
        let store = Arc::new(MemoryStore::new());
        let gate = gate(store.clone());
        store.simulate_outage(true);

        let decision = gate.check_request(&headers("198.51.100.40"), "submit_form").await;
        assert!(decision.decision.allowed);
        assert_eq!(decision.decision.remaining_tokens, 0);
        assert!(!decision.challenge_required);
        assert!(gate.sweep_now().await.is_err());
    }

    #[tokio::test]
    async fn test_manual_sweep() {
        let store = Arc::new(MemoryStore::new());
        let gate = gate(store.clone());

        gate.check_request(&headers("198.51.100.50"), "submit_form").await;
        assert_eq!(gate.sweep(3600).await.unwrap(), 0);
        assert_eq!(gate.sweep_now().await.unwrap(), 0);
        assert_eq!(store.bucket_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_challenge_gate_per_scope() {
        let store = Arc::new(MemoryStore::new());
        let gate = gate(store.clone());
        let offender = ChallengeScope::identifier("198.51.100.60");
        let bystander = ChallengeScope::identifier("198.51.100.61");

        assert!(!gate.challenge_required(&offender).await);
        assert!(!gate.challenge_required(&ChallengeScope::Global).await);

        let h = headers("198.51.100.60");
        for _ in 0..4 {
            gate.check_request(&h, "submit_form").await;
        }
        wait_for_events(&store, 2).await;

        assert!(gate.challenge_required(&offender).await);
        assert!(!gate.challenge_required(&bystander).await);
        assert!(!gate.challenge_required(&ChallengeScope::Global).await);
    }

    #[tokio::test]
    async fn test_tiny_refill_rate_does_not_break_startup() {
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config();
        cfg.policies
            .insert(RateLimitPolicy::new("archive_export", 1, 1e-18));

        let gate = Floodgate::with_stores(
            &cfg,
            store.clone(),
            store.clone(),
            Arc::new(ManualClock::default()),
        )
        .unwrap();
        assert_eq!(gate.janitor().effective_max_age(), Duration::MAX);

        gate.check_request(&headers("198.51.100.70"), "archive_export").await;
        assert_eq!(gate.sweep_now().await.unwrap(), 0);
        assert_eq!(store.bucket_count().await.unwrap(), 1);
    }

    #[test]
    fn test_gate_decision_wire_format() {
        let decision = GateDecision {
            decision: RateLimitDecision::denied(4),
            identifier: "192.0.2.1".to_string(),
            operation: "submit_form".to_string(),
            challenge_required: true,
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["allowed"], false);
        assert_eq!(json["retryAfterSeconds"], 4);
        assert_eq!(json["challengeRequired"], true);
        assert_eq!(json["identifier"], "192.0.2.1");
    }
}
