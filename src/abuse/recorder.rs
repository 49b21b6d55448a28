//! Append-only abuse metrics recording.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::event::{AbuseMetricEvent, EventMetadata, MetricType};
use crate::clock::Clock;
use crate::store::AbuseMetricsStore;

/// Default upper bound on a single metric insert.
pub const DEFAULT_RECORD_TIMEOUT: Duration = Duration::from_millis(250);

/// Records abuse events without ever failing the caller.
///
/// A failed or slow insert is logged and dropped; losing a metric is
/// acceptable, blocking or failing the originating request is not.
#[derive(Clone)]
pub struct AbuseMetricsRecorder {
    store: Arc<dyn AbuseMetricsStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl AbuseMetricsRecorder {
    /// Create a recorder over a metrics store.
    pub fn new(store: Arc<dyn AbuseMetricsStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            timeout: DEFAULT_RECORD_TIMEOUT,
        }
    }

    /// Override the insert timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Append one event, waiting at most the configured timeout.
    ///
    /// Returns whether the event was persisted.
    pub async fn record(
        &self,
        metric_type: MetricType,
        identifier: &str,
        operation: &str,
        metadata: EventMetadata,
    ) -> bool {
        let event = AbuseMetricEvent::new(
            metric_type,
            identifier,
            operation,
            metadata,
            self.clock.now(),
        );

        match tokio::time::timeout(self.timeout, self.store.append(&event)).await {
            Ok(Ok(())) => {
                debug!(
                    metric_type = %metric_type,
                    identifier = %identifier,
                    operation = %operation,
                    "Recorded abuse metric"
                );
                true
            }
            Ok(Err(e)) => {
                warn!(
                    error = %e,
                    metric_type = %metric_type,
                    identifier = %identifier,
                    operation = %operation,
                    "Dropping abuse metric, store write failed"
                );
                false
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    metric_type = %metric_type,
                    identifier = %identifier,
                    operation = %operation,
                    "Dropping abuse metric, store write timed out"
                );
                false
            }
        }
    }

    /// Record on a background task so the caller never waits on the insert.
    ///
    /// Returns `None` when called outside a Tokio runtime, in which case the
    /// event is dropped.
    pub fn record_detached(
        &self,
        metric_type: MetricType,
        identifier: &str,
        operation: &str,
        metadata: EventMetadata,
    ) -> Option<JoinHandle<bool>> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    metric_type = %metric_type,
                    "No async runtime available, dropping abuse metric"
                );
                return None;
            }
        };

        let recorder = self.clone();
        let identifier = identifier.to_string();
        let operation = operation.to_string();
        Some(handle.spawn(async move {
            recorder
                .record(metric_type, &identifier, &operation, metadata)
                .await
        }))
    }
}
