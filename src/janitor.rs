//! Periodic eviction of idle token buckets.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::BucketStore;

/// Sweep schedule and age.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorSettings {
    /// Seconds between sweeps
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Buckets idle longer than this are deleted
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

impl Default for JanitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_max_age_secs() -> u64 {
    86400
}

/// Deletes buckets that have not seen a request for a while.
pub struct BucketJanitor {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    settings: JanitorSettings,
    min_age: Duration,
}

impl BucketJanitor {
    pub fn new(store: Arc<dyn BucketStore>, clock: Arc<dyn Clock>, settings: JanitorSettings) -> Self {
        Self {
            store,
            clock,
            settings,
            min_age: Duration::ZERO,
        }
    }

    /// Never sweep with an age shorter than `min_age`.
    ///
    /// Set this to the longest full-refill window of the configured
    /// policies; evicting a bucket that has not yet refilled would hand its
    /// caller a full burst on the next request.
    pub fn with_min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }

    /// The age used by scheduled sweeps.
    pub fn effective_max_age(&self) -> Duration {
        Duration::from_secs(self.settings.max_age_secs).max(self.min_age)
    }

    /// Delete buckets whose last request is older than `max_age_secs`.
    ///
    /// An age reaching past the earliest representable time deletes nothing.
    pub async fn sweep(&self, max_age_secs: u64) -> Result<u64, StoreError> {
        let cutoff = ChronoDuration::try_seconds(i64::try_from(max_age_secs).unwrap_or(i64::MAX))
            .and_then(|age| self.clock.now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.store.delete_idle_since(cutoff).await?;
        info!(
            removed = removed,
            max_age_secs = max_age_secs,
            cutoff = %cutoff,
            "Swept idle buckets"
        );
        Ok(removed)
    }

    /// Sweep with the configured age.
    pub async fn sweep_stale(&self) -> Result<u64, StoreError> {
        self.sweep(self.effective_max_age().as_secs()).await
    }

    /// Run scheduled sweeps until `shutdown` fires.
    ///
    /// A failed sweep is logged and tried again on the next tick.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let every = Duration::from_secs(self.settings.interval_secs.max(1));
        let max_jitter_ms = (every.as_millis() / 10) as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter_ms));

        tokio::spawn(async move {
            info!(
                interval_secs = every.as_secs(),
                max_age_secs = self.effective_max_age().as_secs(),
                jitter_ms = jitter.as_millis() as u64,
                "Bucket janitor started"
            );

            tokio::select! {
                _ = tokio::time::sleep(jitter) => {}
                _ = shutdown.changed() => {
                    info!("Bucket janitor stopped");
                    return;
                }
            }

            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match self.sweep_stale().await {
                            Ok(removed) => debug!(removed = removed, "Scheduled sweep complete"),
                            Err(e) => warn!(error = %e, "Scheduled sweep failed, retrying next interval"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("Bucket janitor stopped");
        })
    }
}
